//! Notification delivery with pluggable channel support.
//!
//! The alerting core hands fully resolved template contexts to a
//! [`NotificationDispatcher`]. The default dispatcher,
//! [`manager::NotificationManager`], routes each notification to the
//! [`NotificationChannel`] instances registered under the rule's channel
//! ids. Built-in channels are a JSON webhook and a tracing log sink.

pub mod channels;
pub mod error;
pub mod manager;
pub mod plugin;
pub mod utils;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use qwatch_common::types::{NotificationEvent, TemplateContext};

use crate::error::Result;

/// A notification ready for delivery: which lifecycle event happened, and the
/// values describing it.
#[derive(Debug, Clone)]
pub struct Notification {
    pub event: NotificationEvent,
    pub context: TemplateContext,
}

impl Notification {
    /// Looks up a context field rendered as display text.
    pub fn field(&self, key: &str) -> Option<String> {
        self.context.get(key).map(utils::value_to_text)
    }
}

/// A delivery target for notifications (webhook endpoint, log sink, ...).
///
/// Implementations are created by the corresponding [`plugin::ChannelPlugin`]
/// and registered in the [`manager::NotificationManager`] under an id that
/// rules reference in their `channels` list.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Delivers the notification through this channel.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails after retries (if applicable).
    async fn send(&self, notification: &Notification) -> Result<()>;

    /// Returns the channel type name (e.g., `"webhook"`, `"log"`).
    fn channel_type(&self) -> &str;

    /// Returns the id this channel instance is registered under.
    fn instance_id(&self) -> &str;
}

/// Outcome counters for one dispatch call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub failed: usize,
    pub unknown: usize,
}

/// The boundary the alerting core calls to deliver notifications.
///
/// Dispatch never fails from the caller's point of view: delivery errors are
/// logged and counted in the returned summary so alert state, which has
/// already been committed, is never rolled back because of them.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        event: NotificationEvent,
        context: &TemplateContext,
        channels: &[String],
    ) -> DispatchSummary;
}
