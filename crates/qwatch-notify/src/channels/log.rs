use crate::error::{NotifyError, Result};
use crate::plugin::ChannelPlugin;
use crate::utils::render_template;
use crate::{Notification, NotificationChannel};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// Writes notifications to the tracing log. Useful as a default sink and in
/// deployments where an external collector scrapes the logs.
pub struct LogChannel {
    instance_id: String,
    template: Option<String>,
}

impl LogChannel {
    pub fn new(instance_id: &str, template: Option<String>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            template,
        }
    }

    pub fn render(&self, notification: &Notification) -> String {
        match &self.template {
            Some(template) => render_template(template, &notification.context),
            None => notification
                .field("message")
                .or_else(|| notification.field("title"))
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let text = self.render(notification);
        tracing::info!(
            channel = %self.instance_id,
            event = %notification.event,
            rule_id = notification.field("rule_id").unwrap_or_default(),
            alert_id = notification.field("alert_id").unwrap_or_default(),
            "{text}"
        );
        Ok(())
    }

    fn channel_type(&self) -> &str {
        "log"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LogConfig {
    template: Option<String>,
}

pub struct LogPlugin;

impl ChannelPlugin for LogPlugin {
    fn kind(&self) -> &'static str {
        "log"
    }

    fn check(&self, config: &Value) -> Result<()> {
        if config.is_null() {
            return Ok(());
        }
        serde_json::from_value::<LogConfig>(config.clone())
            .map_err(|e| NotifyError::InvalidConfig(format!("log: {e}")))?;
        Ok(())
    }

    fn build(&self, instance_id: &str, config: &Value) -> Result<Box<dyn NotificationChannel>> {
        let template = if config.is_null() {
            None
        } else {
            serde_json::from_value::<LogConfig>(config.clone())?.template
        };
        Ok(Box::new(LogChannel::new(instance_id, template)))
    }
}
