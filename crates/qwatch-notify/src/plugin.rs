//! Channel kinds and the registry that turns `[[channels]]` entries into
//! live [`NotificationChannel`]s.

use crate::error::{NotifyError, Result};
use crate::manager::ChannelConfig;
use crate::NotificationChannel;
use serde_json::Value;
use std::collections::BTreeMap;

/// One kind of channel, selected by the `type` key of a channel entry.
pub trait ChannelPlugin: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Rejects a malformed `config` table before anything is built.
    fn check(&self, config: &Value) -> Result<()>;

    /// Builds the channel rules will reference as `id`. Only called with a
    /// config that passed [`check`](Self::check).
    fn build(&self, id: &str, config: &Value) -> Result<Box<dyn NotificationChannel>>;

    /// `config` as it may appear in logs.
    fn redact(&self, config: &Value) -> Value {
        config.clone()
    }
}

/// A channel built from an entry, with the config safe to log.
pub struct BuiltChannel {
    pub channel: Box<dyn NotificationChannel>,
    pub redacted: Value,
}

/// Channel kinds known to this process, keyed by [`ChannelPlugin::kind`].
///
/// ```
/// use qwatch_notify::plugin::ChannelRegistry;
///
/// let registry = ChannelRegistry::default();
/// assert_eq!(registry.kinds(), vec!["log", "webhook"]);
/// assert!(!registry.supports("pager"));
/// ```
pub struct ChannelRegistry {
    kinds: BTreeMap<&'static str, Box<dyn ChannelPlugin>>,
}

impl ChannelRegistry {
    pub fn empty() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    /// Adds `plugin`, replacing any earlier plugin of the same kind.
    pub fn with(mut self, plugin: impl ChannelPlugin + 'static) -> Self {
        self.kinds.insert(plugin.kind(), Box::new(plugin));
        self
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.kinds.keys().copied().collect()
    }

    pub fn supports(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn plugin(&self, kind: &str) -> Result<&dyn ChannelPlugin> {
        self.kinds
            .get(kind)
            .map(|p| p.as_ref())
            .ok_or_else(|| NotifyError::UnknownChannelType(kind.to_string()))
    }

    pub fn build(&self, entry: &ChannelConfig) -> Result<BuiltChannel> {
        if entry.id.trim().is_empty() {
            return Err(NotifyError::InvalidConfig(format!(
                "{} channel without an id",
                entry.channel_type
            )));
        }
        let plugin = self.plugin(&entry.channel_type)?;
        plugin.check(&entry.config)?;
        Ok(BuiltChannel {
            channel: plugin.build(&entry.id, &entry.config)?,
            redacted: plugin.redact(&entry.config),
        })
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::empty()
            .with(crate::channels::webhook::WebhookPlugin)
            .with(crate::channels::log::LogPlugin)
    }
}
