use qwatch_common::types::{Severity, Timestamp};
use serde::{Deserialize, Serialize};

use crate::conditions::{ErrorLevel, RuleEvaluationState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    /// Declared for compatibility; no transition leads here.
    HalfOpen,
}

impl CircuitState {
    pub fn is_circuit_tripped(&self) -> bool {
        matches!(self, CircuitState::Open | CircuitState::HalfOpen)
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Outcome of one `check_alert` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Success recorded, circuit unchanged.
    Ok,
    /// Failure seen but the trigger delay has not elapsed.
    Pending,
    /// Failure counted, no edge.
    Failure,
    /// CLOSED -> OPEN; a new alert id was minted.
    Open,
    /// OPEN -> CLOSED; `alert_id` is the closed incident.
    Close,
    Warmup,
    Inactive,
    NotFound,
    /// Evaluated without the leader lock; the circuit was read, not advanced.
    Standby,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Pending => "pending",
            CheckStatus::Failure => "failure",
            CheckStatus::Open => "open",
            CheckStatus::Close => "close",
            CheckStatus::Warmup => "warmup",
            CheckStatus::Inactive => "inactive",
            CheckStatus::NotFound => "not_found",
            CheckStatus::Standby => "standby",
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckAlertResponse {
    pub status: CheckStatus,
    pub circuit_state: CircuitState,
    pub failures: u32,
    pub total_failures: u64,
    pub alert_id: Option<String>,
    pub alert_count: u32,
    pub notify: bool,
    pub end_delay_ts: Option<Timestamp>,
}

impl CheckAlertResponse {
    pub fn not_found() -> Self {
        Self {
            status: CheckStatus::NotFound,
            circuit_state: CircuitState::Closed,
            failures: 0,
            total_failures: 0,
            alert_id: None,
            alert_count: 0,
            notify: false,
            end_delay_ts: None,
        }
    }
}

/// Snapshot of a rule's circuit as held by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAlertState {
    pub circuit_state: CircuitState,
    pub is_active: bool,
    pub failures: u32,
    pub total_failures: u64,
    pub last_failure: Option<Timestamp>,
    pub alert_id: Option<String>,
    pub error_status: ErrorLevel,
    /// A notification would be accepted right now.
    pub notify_pending: bool,
    pub alert_count: u32,
    pub end_delay_ts: Option<Timestamp>,
    /// Set only by the `get_state` call that auto-closed this incident.
    pub closed_alert_id: Option<String>,
}

impl RuleAlertState {
    /// Folds a `check_alert` response into this mirror.
    pub fn apply(&mut self, resp: &CheckAlertResponse) {
        match resp.status {
            CheckStatus::NotFound => {
                *self = RuleAlertState::default();
                return;
            }
            CheckStatus::Inactive => self.is_active = false,
            _ => self.is_active = true,
        }
        self.circuit_state = resp.circuit_state;
        self.failures = resp.failures;
        self.total_failures = resp.total_failures;
        self.alert_count = resp.alert_count;
        self.end_delay_ts = resp.end_delay_ts;
        self.alert_id = match resp.status {
            CheckStatus::Close => None,
            _ => resp.alert_id.clone(),
        };
        self.closed_alert_id = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyDecision {
    pub accepted: bool,
    pub alert_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatusChange {
    Activated,
    Deactivated,
    Unchanged,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Close,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Close => "close",
        }
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(AlertStatus::Open),
            "close" => Ok(AlertStatus::Close),
            _ => Err(format!("unknown alert status: {s}")),
        }
    }
}

/// One incident: opened on a CLOSED -> OPEN edge, closed on the paired
/// OPEN -> CLOSED edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAlert {
    pub id: String,
    pub rule_id: String,
    pub host_id: String,
    pub status: AlertStatus,
    pub raised_at: Timestamp,
    pub reset_at: Option<Timestamp>,
    pub value: f64,
    /// Consecutive failures when the alert was raised.
    pub failures: u32,
    pub title: String,
    pub message: String,
    pub state: RuleEvaluationState,
    pub error_level: ErrorLevel,
    pub severity: Severity,
    pub is_read: bool,
}

impl RuleAlert {
    pub fn from_data(host_id: &str, rule_id: &str, data: AlertData, ts: Timestamp) -> Self {
        Self {
            id: data.alert_id,
            rule_id: rule_id.to_string(),
            host_id: host_id.to_string(),
            status: AlertStatus::Open,
            raised_at: ts,
            reset_at: None,
            value: data.value,
            failures: data.failures,
            title: data.title,
            message: data.message,
            state: data.state,
            error_level: data.error_level,
            severity: data.severity,
            is_read: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == AlertStatus::Open
    }
}

/// Payload of `write_alert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertData {
    pub alert_id: String,
    pub value: f64,
    pub failures: u32,
    pub title: String,
    pub message: String,
    pub state: RuleEvaluationState,
    pub error_level: ErrorLevel,
    pub severity: Severity,
}

/// Filter for alert listings. Results are ordered newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertQuery {
    /// Inclusive lower bound on `raised_at`.
    pub since: Option<Timestamp>,
    /// Exclusive upper bound on `raised_at`.
    pub until: Option<Timestamp>,
    pub status: Option<AlertStatus>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl AlertQuery {
    pub fn matches(&self, alert: &RuleAlert) -> bool {
        self.since.map_or(true, |s| alert.raised_at >= s)
            && self.until.map_or(true, |u| alert.raised_at < u)
            && self.status.map_or(true, |s| alert.status == s)
    }

    /// Filters, sorts newest first and pages `alerts`.
    pub fn apply(&self, alerts: impl IntoIterator<Item = RuleAlert>) -> Vec<RuleAlert> {
        let mut matched: Vec<RuleAlert> = alerts.into_iter().filter(|a| self.matches(a)).collect();
        matched.sort_by(|a, b| b.raised_at.cmp(&a.raised_at).then_with(|| b.id.cmp(&a.id)));
        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}
