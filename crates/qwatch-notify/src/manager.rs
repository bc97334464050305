use crate::error::{NotifyError, Result};
use crate::plugin::ChannelRegistry;
use crate::{DispatchSummary, Notification, NotificationChannel, NotificationDispatcher};
use async_trait::async_trait;
use qwatch_common::types::{NotificationEvent, TemplateContext};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Declarative description of one channel instance, as found in the server
/// configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default)]
    pub config: Value,
}

/// Routes notifications to registered channels by id.
pub struct NotificationManager {
    channels: HashMap<String, Box<dyn NotificationChannel>>,
}

impl NotificationManager {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Instantiates every configured channel through the registry. Fails on
    /// the first invalid entry or repeated id so misconfiguration surfaces at
    /// startup.
    pub fn from_configs(registry: &ChannelRegistry, configs: &[ChannelConfig]) -> Result<Self> {
        let mut manager = Self::new();
        for cfg in configs {
            if manager.has_channel(&cfg.id) {
                return Err(NotifyError::InvalidConfig(format!(
                    "channel id '{}' declared twice",
                    cfg.id
                )));
            }
            let built = registry.build(cfg)?;
            tracing::info!(
                channel = %cfg.id,
                channel_type = %cfg.channel_type,
                config = %built.redacted,
                "Notification channel registered"
            );
            manager.register(built.channel);
        }
        Ok(manager)
    }

    pub fn register(&mut self, channel: Box<dyn NotificationChannel>) {
        self.channels
            .insert(channel.instance_id().to_string(), channel);
    }

    pub fn channel_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.channels.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn has_channel(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationDispatcher for NotificationManager {
    async fn dispatch(
        &self,
        event: NotificationEvent,
        context: &TemplateContext,
        channels: &[String],
    ) -> DispatchSummary {
        let notification = Notification {
            event,
            context: context.clone(),
        };
        let mut summary = DispatchSummary::default();

        for id in channels {
            let Some(channel) = self.channels.get(id) else {
                tracing::warn!(channel = %id, event = %event, "Notification channel not configured");
                summary.unknown += 1;
                continue;
            };
            match channel.send(&notification).await {
                Ok(()) => summary.delivered += 1,
                Err(e) => {
                    tracing::error!(
                        channel = %id,
                        channel_type = channel.channel_type(),
                        event = %event,
                        error = %e,
                        "Notification delivery failed"
                    );
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}
