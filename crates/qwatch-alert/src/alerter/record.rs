//! Circuit-breaker transitions over one rule's persisted state.
//!
//! Every store implementation loads a [`RuleStateRecord`], applies exactly
//! one transition method and writes it back inside a single atomic step,
//! so the transition rules live here once.

use qwatch_common::types::Timestamp;
use serde::{Deserialize, Serialize};

use super::types::{
    CheckAlertResponse, CheckStatus, CircuitState, NotifyDecision, RuleAlertState,
    RuleStatusChange,
};
use crate::conditions::ErrorLevel;
use crate::rule::{AlertOptions, Rule, RuleState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStateRecord {
    pub options: AlertOptions,
    pub channel_count: usize,
    pub is_active: bool,
    pub circuit: CircuitState,
    /// Consecutive failures counted toward opening.
    pub failures: u32,
    /// Consecutive successes counted toward closing.
    pub successes: u32,
    pub total_failures: u64,
    pub last_failure: Option<Timestamp>,
    /// Start of the current failing streak, for the trigger delay.
    pub first_failure: Option<Timestamp>,
    pub alert_id: Option<String>,
    /// Notifications sent for the current incident.
    pub alert_count: u32,
    pub last_notify: Option<Timestamp>,
    /// Time after which an open circuit closes on its own.
    pub end_delay: Option<Timestamp>,
    pub warmup_end: Option<Timestamp>,
    pub error_level: ErrorLevel,
}

impl RuleStateRecord {
    pub fn new(rule: &Rule, ts: Timestamp) -> Self {
        let mut record = Self {
            options: rule.alert_options.clone(),
            channel_count: rule.channels.len(),
            is_active: false,
            circuit: CircuitState::Closed,
            failures: 0,
            successes: 0,
            total_failures: 0,
            last_failure: None,
            first_failure: None,
            alert_id: None,
            alert_count: 0,
            last_notify: None,
            end_delay: None,
            warmup_end: None,
            error_level: ErrorLevel::None,
        };
        if rule.is_active {
            record.activate(ts);
        }
        record
    }

    /// Picks up a changed rule definition; counters and the open incident
    /// are kept.
    pub fn configure(&mut self, rule: &Rule, ts: Timestamp) -> RuleStatusChange {
        self.options = rule.alert_options.clone();
        self.channel_count = rule.channels.len();
        if rule.is_active {
            self.activate(ts)
        } else {
            self.deactivate()
        }
    }

    pub fn activate(&mut self, ts: Timestamp) -> RuleStatusChange {
        if self.is_active {
            return RuleStatusChange::Unchanged;
        }
        self.is_active = true;
        self.warmup_end = (self.options.warmup_window > 0).then(|| ts + self.options.warmup_window);
        RuleStatusChange::Activated
    }

    pub fn deactivate(&mut self) -> RuleStatusChange {
        if !self.is_active {
            return RuleStatusChange::Unchanged;
        }
        self.is_active = false;
        RuleStatusChange::Deactivated
    }

    /// Applies one evaluation outcome. `mint_id` is called only on a
    /// CLOSED -> OPEN edge.
    pub fn check(
        &mut self,
        level: ErrorLevel,
        ts: Timestamp,
        mint_id: impl FnOnce() -> String,
    ) -> CheckAlertResponse {
        if !self.is_active {
            return self.response(CheckStatus::Inactive, None);
        }
        if self.warmup_end.is_some_and(|end| ts < end) {
            return self.response(CheckStatus::Warmup, None);
        }
        if level.is_failure() {
            self.record_failure(level, ts, mint_id)
        } else {
            self.record_success(ts)
        }
    }

    fn record_success(&mut self, ts: Timestamp) -> CheckAlertResponse {
        self.failures = 0;
        self.first_failure = None;
        self.successes = self.successes.saturating_add(1);

        if !self.circuit.is_circuit_tripped() {
            self.error_level = ErrorLevel::None;
            return self.response(CheckStatus::Ok, None);
        }

        let enough = self.successes >= self.options.success_threshold;
        let recovered = if self.options.recovery_window == 0 {
            enough
        } else {
            let fallback = self.last_failure.unwrap_or(ts) + self.options.recovery_window;
            let end = *self.end_delay.get_or_insert(fallback);
            enough && ts >= end
        };

        if recovered {
            let closed = self.close();
            let notify = self.channel_count > 0 && self.options.alert_on_reset;
            let mut resp = self.response(CheckStatus::Close, closed);
            resp.notify = notify;
            resp
        } else {
            self.response(CheckStatus::Ok, None)
        }
    }

    fn record_failure(
        &mut self,
        level: ErrorLevel,
        ts: Timestamp,
        mint_id: impl FnOnce() -> String,
    ) -> CheckAlertResponse {
        self.successes = 0;
        self.total_failures += 1;
        self.last_failure = Some(ts);
        self.error_level = level;

        if self.options.trigger_delay > 0 {
            let streak_start = *self.first_failure.get_or_insert(ts);
            if ts - streak_start < self.options.trigger_delay {
                return self.response(CheckStatus::Pending, None);
            }
        }
        self.failures = self.failures.saturating_add(1);

        let window = self.options.recovery_window;
        if !self.circuit.is_circuit_tripped() {
            if self.failures < self.options.failure_threshold {
                return self.response(CheckStatus::Failure, None);
            }
            self.circuit = CircuitState::Open;
            self.alert_id = Some(mint_id());
            self.alert_count = 0;
            self.last_notify = None;
            self.end_delay = (window > 0).then_some(ts + window);
            let mut resp = self.response(CheckStatus::Open, None);
            resp.notify = self.channel_count > 0;
            return resp;
        }

        if window > 0 {
            // Extend a pending window, capped at two windows past this
            // failure; a lapsed one restarts from here.
            self.end_delay = Some(match self.end_delay {
                Some(end) if ts <= end => (end + window).min(ts + 2 * window),
                _ => ts + window,
            });
        }
        let mut resp = self.response(CheckStatus::Failure, None);
        resp.notify = self.channel_count > 0;
        resp
    }

    /// Resets the circuit and returns the id of the incident it closed.
    pub fn close(&mut self) -> Option<String> {
        self.circuit = CircuitState::Closed;
        self.failures = 0;
        self.successes = 0;
        self.first_failure = None;
        self.alert_count = 0;
        self.last_notify = None;
        self.end_delay = None;
        self.error_level = ErrorLevel::None;
        self.alert_id.take()
    }

    /// Closes the circuit if `alert_id` is its current incident.
    pub fn close_if_current(&mut self, alert_id: &str) -> bool {
        if self.alert_id.as_deref() == Some(alert_id) {
            self.close();
            true
        } else {
            false
        }
    }

    /// Reads the state at `ts`, first closing an open circuit whose
    /// recovery window has elapsed.
    pub fn state_at(&mut self, ts: Timestamp) -> RuleAlertState {
        let mut closed = None;
        if self.circuit.is_circuit_tripped() && self.end_delay.is_some_and(|end| ts > end) {
            closed = self.close();
        }
        let mut state = self.snapshot(ts);
        state.closed_alert_id = closed;
        state
    }

    pub fn mark_notify(&mut self, alert_id: &str, ts: Timestamp) -> NotifyDecision {
        let rejected = NotifyDecision {
            accepted: false,
            alert_count: self.alert_count,
        };
        if !self.circuit.is_circuit_tripped() || self.alert_id.as_deref() != Some(alert_id) {
            return rejected;
        }
        if self.alert_count >= self.options.max_alerts_per_event {
            return rejected;
        }
        if self
            .last_notify
            .is_some_and(|last| ts - last < self.options.notify_interval)
        {
            return rejected;
        }
        self.alert_count += 1;
        self.last_notify = Some(ts);
        NotifyDecision {
            accepted: true,
            alert_count: self.alert_count,
        }
    }

    fn notify_allowed(&self, ts: Timestamp) -> bool {
        self.circuit.is_circuit_tripped()
            && self.channel_count > 0
            && self.alert_count < self.options.max_alerts_per_event
            && self
                .last_notify
                .map_or(true, |last| ts - last >= self.options.notify_interval)
    }

    pub fn snapshot(&self, ts: Timestamp) -> RuleAlertState {
        RuleAlertState {
            circuit_state: self.circuit,
            is_active: self.is_active,
            failures: self.failures,
            total_failures: self.total_failures,
            last_failure: self.last_failure,
            alert_id: self.alert_id.clone(),
            error_status: self.error_level,
            notify_pending: self.notify_allowed(ts),
            alert_count: self.alert_count,
            end_delay_ts: self.end_delay,
            closed_alert_id: None,
        }
    }

    fn response(&self, status: CheckStatus, closed: Option<String>) -> CheckAlertResponse {
        CheckAlertResponse {
            status,
            circuit_state: self.circuit,
            failures: self.failures,
            total_failures: self.total_failures,
            alert_id: closed.or_else(|| self.alert_id.clone()),
            alert_count: self.alert_count,
            notify: false,
            end_delay_ts: self.end_delay,
        }
    }

    /// Summary state the rule should show after this record changed.
    pub fn summary_state(&self) -> RuleState {
        if !self.is_active {
            return RuleState::Muted;
        }
        match (self.circuit.is_circuit_tripped(), self.error_level) {
            (true, ErrorLevel::Critical) => RuleState::Error,
            (true, _) => RuleState::Warning,
            (false, _) => RuleState::Normal,
        }
    }
}

/// Prepares a rule for persistence: keeps creation time and summary fields
/// of the stored version and stamps the update time.
pub fn merge_saved_rule(existing: Option<&Rule>, rule: &Rule, ts: Timestamp) -> Rule {
    let mut saved = rule.clone();
    match existing {
        Some(prev) => {
            saved.created_at = prev.created_at;
            saved.last_triggered_at = prev.last_triggered_at;
            saved.state = if rule.is_active && prev.state == RuleState::Muted {
                RuleState::Normal
            } else if !rule.is_active {
                RuleState::Muted
            } else {
                prev.state
            };
        }
        None => {
            saved.created_at = if rule.created_at > 0 { rule.created_at } else { ts };
            saved.state = if rule.is_active {
                RuleState::Normal
            } else {
                RuleState::Muted
            };
        }
    }
    saved.updated_at = ts;
    saved
}

/// Copies the authoritative counters of `record` onto a stored rule.
pub fn apply_record(rule: &mut Rule, record: &RuleStateRecord) {
    rule.is_active = record.is_active;
    rule.total_failures = record.total_failures;
    rule.alert_count = record.alert_count;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::threshold::{CompareOp, ThresholdCondition};
    use crate::conditions::RuleCondition;

    fn rule(options: AlertOptions) -> Rule {
        Rule::new(
            "r1",
            "rule",
            "m",
            RuleCondition::Threshold(ThresholdCondition {
                operator: CompareOp::Gt,
                error_threshold: 1.0,
                warning_threshold: None,
                unit: None,
                reduction: Default::default(),
            }),
        )
        .with_options(options)
        .with_channels(vec!["ops".into()])
    }

    fn mint() -> String {
        "alert-1".to_string()
    }

    #[test]
    fn opens_on_failure_threshold() {
        let mut record = RuleStateRecord::new(
            &rule(AlertOptions {
                failure_threshold: 3,
                ..AlertOptions::default()
            }),
            0,
        );
        let first = record.check(ErrorLevel::Critical, 1, mint);
        assert_eq!(first.status, CheckStatus::Failure);
        assert_eq!(first.circuit_state, CircuitState::Closed);
        let second = record.check(ErrorLevel::Critical, 2, mint);
        assert_eq!(second.circuit_state, CircuitState::Closed);
        let third = record.check(ErrorLevel::Critical, 3, mint);
        assert_eq!(third.status, CheckStatus::Open);
        assert_eq!(third.circuit_state, CircuitState::Open);
        assert_eq!(third.alert_id.as_deref(), Some("alert-1"));
        assert!(third.notify);
        assert_eq!(third.total_failures, 3);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut record = RuleStateRecord::new(
            &rule(AlertOptions {
                failure_threshold: 2,
                ..AlertOptions::default()
            }),
            0,
        );
        record.check(ErrorLevel::Critical, 1, mint);
        let ok = record.check(ErrorLevel::None, 2, mint);
        assert_eq!(ok.status, CheckStatus::Ok);
        assert_eq!(ok.failures, 0);
        assert_eq!(ok.total_failures, 1);
        let again = record.check(ErrorLevel::Warning, 3, mint);
        assert_eq!(again.status, CheckStatus::Failure);
    }

    #[test]
    fn success_threshold_closes_without_recovery_window() {
        let mut record = RuleStateRecord::new(
            &rule(AlertOptions {
                success_threshold: 2,
                ..AlertOptions::default()
            }),
            0,
        );
        assert_eq!(record.check(ErrorLevel::Critical, 0, mint).status, CheckStatus::Open);
        assert_eq!(record.check(ErrorLevel::None, 10, mint).status, CheckStatus::Ok);
        let closed = record.check(ErrorLevel::None, 20, mint);
        assert_eq!(closed.status, CheckStatus::Close);
        assert_eq!(closed.alert_id.as_deref(), Some("alert-1"));
        assert_eq!(closed.circuit_state, CircuitState::Closed);
        assert!(record.alert_id.is_none());
    }

    #[test]
    fn success_inside_recovery_window_keeps_circuit_open() {
        let mut record = RuleStateRecord::new(
            &rule(AlertOptions {
                recovery_window: 100,
                ..AlertOptions::default()
            }),
            0,
        );
        record.check(ErrorLevel::Critical, 0, mint);
        assert_eq!(record.check(ErrorLevel::None, 50, mint).status, CheckStatus::Ok);
        assert_eq!(record.circuit, CircuitState::Open);
        assert_eq!(record.check(ErrorLevel::None, 100, mint).status, CheckStatus::Close);
    }

    #[test]
    fn recovery_window_auto_closes_on_read() {
        let mut record = RuleStateRecord::new(
            &rule(AlertOptions {
                recovery_window: 100,
                ..AlertOptions::default()
            }),
            0,
        );
        record.check(ErrorLevel::Critical, 0, mint);
        assert_eq!(record.state_at(100).circuit_state, CircuitState::Open);
        let state = record.state_at(150);
        assert_eq!(state.circuit_state, CircuitState::Closed);
        assert_eq!(state.closed_alert_id.as_deref(), Some("alert-1"));
        assert_eq!(record.state_at(160).closed_alert_id, None);
    }

    #[test]
    fn failure_extends_recovery_window() {
        let mut record = RuleStateRecord::new(
            &rule(AlertOptions {
                recovery_window: 100,
                ..AlertOptions::default()
            }),
            0,
        );
        record.check(ErrorLevel::Critical, 0, mint);
        let resp = record.check(ErrorLevel::Critical, 50, mint);
        assert_eq!(resp.status, CheckStatus::Failure);
        assert_eq!(resp.end_delay_ts, Some(200));
        assert_eq!(record.state_at(151).circuit_state, CircuitState::Open);
        assert_eq!(record.state_at(202).circuit_state, CircuitState::Closed);
    }

    #[test]
    fn trigger_delay_holds_failures_pending() {
        let mut record = RuleStateRecord::new(
            &rule(AlertOptions {
                trigger_delay: 100,
                ..AlertOptions::default()
            }),
            0,
        );
        assert_eq!(record.check(ErrorLevel::Critical, 0, mint).status, CheckStatus::Pending);
        assert_eq!(record.check(ErrorLevel::Critical, 50, mint).status, CheckStatus::Pending);
        assert_eq!(record.check(ErrorLevel::Critical, 100, mint).status, CheckStatus::Open);

        // A success breaks the streak.
        let mut record = RuleStateRecord::new(
            &rule(AlertOptions {
                trigger_delay: 100,
                ..AlertOptions::default()
            }),
            0,
        );
        record.check(ErrorLevel::Critical, 0, mint);
        record.check(ErrorLevel::None, 60, mint);
        assert_eq!(record.check(ErrorLevel::Critical, 120, mint).status, CheckStatus::Pending);
        assert_eq!(record.total_failures, 2);
    }

    #[test]
    fn warmup_and_inactive_change_nothing() {
        let mut record = RuleStateRecord::new(
            &rule(AlertOptions {
                warmup_window: 1000,
                ..AlertOptions::default()
            }),
            0,
        );
        let resp = record.check(ErrorLevel::Critical, 500, mint);
        assert_eq!(resp.status, CheckStatus::Warmup);
        assert_eq!(record.total_failures, 0);
        assert_eq!(record.check(ErrorLevel::Critical, 1000, mint).status, CheckStatus::Open);

        record.deactivate();
        let resp = record.check(ErrorLevel::Critical, 2000, mint);
        assert_eq!(resp.status, CheckStatus::Inactive);
        assert_eq!(record.total_failures, 1);
        assert_eq!(record.summary_state(), RuleState::Muted);
    }

    #[test]
    fn notify_interval_throttles_repeats() {
        let mut record = RuleStateRecord::new(
            &rule(AlertOptions {
                notify_interval: 100,
                max_alerts_per_event: 10,
                ..AlertOptions::default()
            }),
            0,
        );
        let mut counts = Vec::new();
        for ts in [0, 20, 40, 100] {
            let resp = record.check(ErrorLevel::Critical, ts, mint);
            let id = resp.alert_id.unwrap();
            counts.push(record.mark_notify(&id, ts).alert_count);
        }
        assert_eq!(counts, vec![1, 1, 1, 2]);
    }

    #[test]
    fn max_alerts_per_event_caps_count() {
        let mut record = RuleStateRecord::new(
            &rule(AlertOptions {
                max_alerts_per_event: 4,
                ..AlertOptions::default()
            }),
            0,
        );
        let mut last = 0;
        for ts in 0..6 {
            let resp = record.check(ErrorLevel::Critical, ts, mint);
            last = record.mark_notify(resp.alert_id.as_deref().unwrap(), ts).alert_count;
        }
        assert_eq!(last, 4);
        assert!(!record.snapshot(10).notify_pending);
    }

    #[test]
    fn stale_alert_id_is_not_notified() {
        let mut record = RuleStateRecord::new(&rule(AlertOptions::default()), 0);
        record.check(ErrorLevel::Critical, 0, mint);
        let decision = record.mark_notify("other", 0);
        assert!(!decision.accepted);
        assert_eq!(decision.alert_count, 0);
    }

    #[test]
    fn merge_keeps_creation_time() {
        let base = rule(AlertOptions::default());
        let first = merge_saved_rule(None, &base, 10);
        assert_eq!(first.created_at, 10);
        let mut changed = base.clone();
        changed.name = "renamed".into();
        changed.is_active = false;
        let second = merge_saved_rule(Some(&first), &changed, 20);
        assert_eq!(second.created_at, 10);
        assert_eq!(second.updated_at, 20);
        assert_eq!(second.state, RuleState::Muted);
    }
}
