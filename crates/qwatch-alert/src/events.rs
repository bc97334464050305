//! In-process rule and alert events, fanned out over a
//! `tokio::sync::broadcast` channel.

use qwatch_common::types::Timestamp;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::alerter::RuleAlert;
use crate::rule::{Rule, RuleState};

/// A change in the lifecycle of a rule or one of its alerts.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum RuleEvent {
    #[serde(rename = "rule.added")]
    RuleAdded(Box<Rule>),
    #[serde(rename = "rule.updated")]
    RuleUpdated(Box<Rule>),
    #[serde(rename = "rule.deleted")]
    RuleDeleted { rule_id: String },
    #[serde(rename = "rule.activated")]
    RuleActivated { rule_id: String },
    #[serde(rename = "rule.deactivated")]
    RuleDeactivated { rule_id: String },
    #[serde(rename = "rule.state-changed")]
    RuleStateChanged { rule_id: String, state: RuleState },
    #[serde(rename = "alert.triggered")]
    AlertTriggered(Box<RuleAlert>),
    #[serde(rename = "alert.reset")]
    AlertReset {
        rule_id: String,
        alert_id: String,
        reset_at: Timestamp,
    },
}

impl RuleEvent {
    /// Dotted event name, e.g. `"alert.triggered"`.
    pub fn name(&self) -> &'static str {
        match self {
            RuleEvent::RuleAdded(_) => "rule.added",
            RuleEvent::RuleUpdated(_) => "rule.updated",
            RuleEvent::RuleDeleted { .. } => "rule.deleted",
            RuleEvent::RuleActivated { .. } => "rule.activated",
            RuleEvent::RuleDeactivated { .. } => "rule.deactivated",
            RuleEvent::RuleStateChanged { .. } => "rule.state-changed",
            RuleEvent::AlertTriggered(_) => "alert.triggered",
            RuleEvent::AlertReset { .. } => "alert.reset",
        }
    }

    pub fn rule_id(&self) -> &str {
        match self {
            RuleEvent::RuleAdded(rule) | RuleEvent::RuleUpdated(rule) => &rule.id,
            RuleEvent::AlertTriggered(alert) => &alert.rule_id,
            RuleEvent::RuleDeleted { rule_id }
            | RuleEvent::RuleActivated { rule_id }
            | RuleEvent::RuleDeactivated { rule_id }
            | RuleEvent::RuleStateChanged { rule_id, .. }
            | RuleEvent::AlertReset { rule_id, .. } => rule_id,
        }
    }
}

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out bus for [`RuleEvent`]s. Cloning yields another handle to the
/// same channel.
///
/// ```
/// use qwatch_alert::events::{EventBus, RuleEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
/// bus.publish(RuleEvent::RuleDeleted { rule_id: "r1".into() });
/// assert_eq!(rx.try_recv().unwrap().name(), "rule.deleted");
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuleEvent>,
}

impl EventBus {
    /// Slow receivers observe `RecvError::Lagged` once `capacity` events are
    /// buffered.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes to all current subscribers. Dropped when nobody listens.
    pub fn publish(&self, event: RuleEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuleEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
