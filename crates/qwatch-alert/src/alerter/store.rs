use async_trait::async_trait;
use qwatch_common::types::Timestamp;

use super::types::{
    AlertData, AlertQuery, CheckAlertResponse, NotifyDecision, RuleAlert, RuleAlertState,
    RuleStatusChange,
};
use crate::conditions::ErrorLevel;
use crate::error::Result;
use crate::rule::Rule;

/// Authoritative home of rule circuit state and alert records.
///
/// Every method is one atomic step keyed by rule id: concurrent evaluators
/// (threads, tasks or processes sharing the backend) observe each call as
/// either fully applied or not applied at all. Callers never advance their
/// own view of a circuit except from the responses returned here.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Records one evaluation outcome and applies any circuit transition.
    async fn check_alert(
        &self,
        rule_id: &str,
        level: ErrorLevel,
        ts: Timestamp,
    ) -> Result<CheckAlertResponse>;

    /// Reads a rule's circuit, auto-closing it when its recovery window has
    /// elapsed. `None` for unknown rules.
    async fn get_state(&self, rule_id: &str, ts: Timestamp) -> Result<Option<RuleAlertState>>;

    /// Reads a rule's circuit without mutating anything, even when the
    /// recovery window has elapsed.
    async fn peek_state(&self, rule_id: &str, ts: Timestamp) -> Result<Option<RuleAlertState>>;

    /// Persists the alert of a freshly opened incident. Writing an id that
    /// already exists returns the stored alert unchanged.
    async fn write_alert(
        &self,
        host_id: &str,
        rule_id: &str,
        data: AlertData,
        ts: Timestamp,
    ) -> Result<RuleAlert>;

    /// Closes an alert. `Ok(false)` when it was already closed.
    async fn reset_alert(&self, rule_id: &str, alert_id: &str, ts: Timestamp) -> Result<bool>;

    /// Asks to send one notification for the current incident.
    async fn mark_notify(
        &self,
        rule_id: &str,
        alert_id: &str,
        ts: Timestamp,
    ) -> Result<NotifyDecision>;

    async fn activate_rule(&self, rule_id: &str, ts: Timestamp) -> Result<RuleStatusChange>;

    async fn deactivate_rule(&self, rule_id: &str, ts: Timestamp) -> Result<RuleStatusChange>;

    async fn queue_alert_count(&self, queue_id: &str) -> Result<u64>;

    async fn host_alert_count(&self, host_id: &str) -> Result<u64>;

    /// Creates or replaces a rule definition. Circuit counters survive a
    /// replace.
    async fn save_rule(&self, host_id: &str, rule: &Rule, ts: Timestamp) -> Result<Rule>;

    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>>;

    async fn list_rules(&self, host_id: &str) -> Result<Vec<Rule>>;

    /// Removes a rule with its circuit state and alerts.
    async fn delete_rule(&self, rule_id: &str) -> Result<bool>;

    async fn get_alerts(&self, rule_id: &str, query: &AlertQuery) -> Result<Vec<RuleAlert>>;

    async fn get_alert(&self, rule_id: &str, alert_id: &str) -> Result<Option<RuleAlert>>;

    async fn delete_alert(&self, rule_id: &str, alert_id: &str) -> Result<bool>;

    async fn mark_alert_read(&self, rule_id: &str, alert_id: &str) -> Result<bool>;

    /// Deletes closed alerts raised before `before`.
    async fn prune_alerts(&self, before: Timestamp) -> Result<u64>;
}

/// Counter key for alerts raised under a queue.
pub fn queue_counter_key(queue_id: &str) -> String {
    format!("queue:{queue_id}")
}

/// Counter key for alerts raised on a host.
pub fn host_counter_key(host_id: &str) -> String {
    format!("host:{host_id}")
}
