use std::borrow::Cow;

use qwatch_common::types::{Severity, Timestamp};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::conditions::change::ChangeCondition;
use crate::conditions::peak::PeakCondition;
use crate::conditions::threshold::ThresholdCondition;
use crate::conditions::RuleCondition;
use crate::error::Result;

/// User-facing summary of a rule, distinct from its circuit state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleState {
    #[default]
    Normal,
    Warning,
    Error,
    Muted,
}

impl std::fmt::Display for RuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleState::Normal => write!(f, "normal"),
            RuleState::Warning => write!(f, "warning"),
            RuleState::Error => write!(f, "error"),
            RuleState::Muted => write!(f, "muted"),
        }
    }
}

fn default_one() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Circuit-breaker policy of a rule. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct AlertOptions {
    /// No alert may open until this long after activation.
    #[serde(default)]
    #[validate(range(min = 0))]
    pub warmup_window: i64,
    /// Consecutive failures needed to open the circuit.
    #[serde(default = "default_one")]
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    /// Consecutive successes needed to close it.
    #[serde(default = "default_one")]
    #[validate(range(min = 1))]
    pub success_threshold: u32,
    /// A failing streak must last this long before failures count.
    #[serde(default)]
    #[validate(range(min = 0))]
    pub trigger_delay: i64,
    /// Quiet period after the last failure before an open circuit closes.
    #[serde(default)]
    #[validate(range(min = 0))]
    pub recovery_window: i64,
    /// Minimum gap between notifications for one incident.
    #[serde(default)]
    #[validate(range(min = 0))]
    pub notify_interval: i64,
    #[serde(default = "default_one")]
    #[validate(range(min = 1))]
    pub max_alerts_per_event: u32,
    #[serde(default = "default_true")]
    pub alert_on_reset: bool,
}

impl Default for AlertOptions {
    fn default() -> Self {
        Self {
            warmup_window: 0,
            failure_threshold: 1,
            success_threshold: 1,
            trigger_delay: 0,
            recovery_window: 0,
            notify_interval: 0,
            max_alerts_per_event: 1,
            alert_on_reset: true,
        }
    }
}

/// An alerting rule bound to one metric.
///
/// ```
/// use qwatch_alert::rule::Rule;
///
/// let rule: Rule = serde_json::from_str(r#"{
///     "id": "wait-time",
///     "name": "Queue wait time",
///     "metric_id": "queue.wait_time",
///     "condition": { "type": "threshold", "operator": "GT", "error_threshold": 500.0 },
///     "alert_options": { "failure_threshold": 3, "recovery_window": 60000 }
/// }"#).unwrap();
/// assert!(rule.check().is_ok());
/// assert_eq!(rule.alert_options.failure_threshold, 3);
/// assert!(rule.is_active);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Rule {
    #[validate(length(min = 1, max = 128))]
    pub id: String,
    #[validate(length(min = 1, max = 256))]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[validate(length(min = 1, max = 256))]
    pub metric_id: String,
    /// Scope the rule belongs to; alert counters are kept per queue.
    #[serde(default)]
    pub queue_id: Option<String>,
    #[validate(custom(function = "validate_condition"))]
    pub condition: RuleCondition,
    #[serde(default)]
    #[validate(nested)]
    pub alert_options: AlertOptions,
    /// Notification channel ids.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub severity: Severity,
    /// Message template with `{{field}}` placeholders.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub state: RuleState,
    #[serde(default)]
    pub total_failures: u64,
    #[serde(default)]
    pub alert_count: u32,
    #[serde(default)]
    pub last_triggered_at: Option<Timestamp>,
    #[serde(default)]
    pub created_at: Timestamp,
    #[serde(default)]
    pub updated_at: Timestamp,
}

impl Rule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        metric_id: impl Into<String>,
        condition: RuleCondition,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            metric_id: metric_id.into(),
            queue_id: None,
            condition,
            alert_options: AlertOptions::default(),
            channels: Vec::new(),
            severity: Severity::default(),
            message: None,
            is_active: true,
            state: RuleState::Normal,
            total_failures: 0,
            alert_count: 0,
            last_triggered_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn with_options(mut self, options: AlertOptions) -> Self {
        self.alert_options = options;
        self
    }

    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_queue(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }

    /// Runs every field and condition check.
    pub fn check(&self) -> Result<()> {
        self.validate()?;
        Ok(())
    }
}

fn invalid(code: &'static str, message: String) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::Owned(message));
    err
}

fn finite(name: &str, value: f64) -> std::result::Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(invalid("not_finite", format!("{name} must be a finite number")))
    }
}

fn validate_threshold(c: &ThresholdCondition) -> std::result::Result<(), ValidationError> {
    finite("error_threshold", c.error_threshold)?;
    if let Some(w) = c.warning_threshold {
        finite("warning_threshold", w)?;
    }
    Ok(())
}

fn validate_peak(c: &PeakCondition) -> std::result::Result<(), ValidationError> {
    if c.lag == 0 {
        return Err(invalid("peak_lag", "lag must be at least 1".into()));
    }
    if !(c.deviations.is_finite() && c.deviations > 0.0) {
        return Err(invalid("peak_deviations", "deviations must be positive".into()));
    }
    if let Some(w) = c.warning_deviations {
        if !(w.is_finite() && w > 0.0 && w < c.deviations) {
            return Err(invalid(
                "peak_warning_deviations",
                "warning_deviations must be positive and below deviations".into(),
            ));
        }
    }
    if !(0.0..=1.0).contains(&c.influence) {
        return Err(invalid("peak_influence", "influence must be within [0, 1]".into()));
    }
    if c.window_size <= 0 {
        return Err(invalid("peak_window", "window_size must be positive".into()));
    }
    if c.trigger_window.is_some_and(|w| w < 0) {
        return Err(invalid("peak_trigger_window", "trigger_window must not be negative".into()));
    }
    if let Some(f) = c.threshold_fraction {
        if !(f > 0.0 && f <= 1.0) {
            return Err(invalid(
                "peak_threshold_fraction",
                "threshold_fraction must be within (0, 1]".into(),
            ));
        }
    }
    Ok(())
}

fn validate_change(c: &ChangeCondition) -> std::result::Result<(), ValidationError> {
    finite("error_threshold", c.error_threshold)?;
    if let Some(w) = c.warning_threshold {
        finite("warning_threshold", w)?;
    }
    if c.sample_interval <= 0 {
        return Err(invalid("change_interval", "sample_interval must be positive".into()));
    }
    if c.window_size < c.sample_interval || c.window_size % c.sample_interval != 0 {
        return Err(invalid(
            "change_window",
            format!(
                "window_size ({}) must be a positive multiple of sample_interval ({})",
                c.window_size, c.sample_interval
            ),
        ));
    }
    if c.time_shift < 0 {
        return Err(invalid("change_time_shift", "time_shift must not be negative".into()));
    }
    Ok(())
}

fn validate_condition(condition: &RuleCondition) -> std::result::Result<(), ValidationError> {
    match condition {
        RuleCondition::Threshold(c) => validate_threshold(c),
        RuleCondition::Peak(c) => validate_peak(c),
        RuleCondition::Change(c) => validate_change(c),
    }
}
