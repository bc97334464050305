//! Rule alerting core: metric aggregation, condition evaluation and a
//! circuit-breaker alert lifecycle shared safely across evaluators.
//!
//! Raw [`MetricSample`](qwatch_common::types::MetricSample)s are folded into
//! windowed aggregates ([`aggregation`]) and a raw [`history`]. On every
//! snapshot the [`manager::RuleManager`] runs each rule's condition
//! ([`conditions`]) and hands the outcome to the rule's
//! [`alerter::RuleAlerter`], which drives the authoritative circuit held by
//! an [`alerter::AlertStore`].

pub mod aggregation;
pub mod alerter;
pub mod conditions;
pub mod error;
pub mod events;
pub mod history;
pub mod manager;
pub mod metrics;
pub mod rule;
pub mod stats;

#[cfg(test)]
mod tests;

pub use alerter::{AlertStore, LeaderLock, MemoryAlertStore, RuleAlerter};
pub use error::{AlertError, Result};
pub use events::{EventBus, RuleEvent};
pub use manager::RuleManager;
pub use rule::{AlertOptions, Rule, RuleState};
