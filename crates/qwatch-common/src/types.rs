use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch. Every timestamp crossing a crate
/// boundary uses this representation.
pub type Timestamp = i64;

/// Current wall-clock time as a [`Timestamp`].
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Converts a [`Timestamp`] into a UTC datetime, clamping values chrono
/// cannot represent to the epoch.
///
/// # Examples
///
/// ```
/// use qwatch_common::types::to_datetime;
///
/// let dt = to_datetime(1_700_000_000_000);
/// assert_eq!(dt.timestamp_millis(), 1_700_000_000_000);
/// ```
pub fn to_datetime(ts: Timestamp) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts)
        .single()
        .unwrap_or_default()
}

/// A single raw observation of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric_id: String,
    pub timestamp: Timestamp,
    pub value: f64,
}

impl MetricSample {
    pub fn new(metric_id: impl Into<String>, timestamp: Timestamp, value: f64) -> Self {
        Self {
            metric_id: metric_id.into(),
            timestamp,
            value,
        }
    }
}

/// Rule severity, ordered from lowest to highest.
///
/// # Examples
///
/// ```
/// use qwatch_common::types::Severity;
///
/// let sev: Severity = "warning".parse().unwrap();
/// assert_eq!(sev, Severity::Warning);
/// assert_eq!(sev.to_string(), "warning");
/// assert!(Severity::Critical > Severity::Info);
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// The kind of notification the alerting core asks a dispatcher to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationEvent {
    /// A new incident was opened.
    #[serde(rename = "alert.triggered")]
    AlertTriggered,
    /// A throttled repeat notification for an incident that is still open.
    #[serde(rename = "alert.repeated")]
    AlertRepeated,
    /// An incident was closed.
    #[serde(rename = "alert.reset")]
    AlertReset,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::AlertTriggered => "alert.triggered",
            NotificationEvent::AlertRepeated => "alert.repeated",
            NotificationEvent::AlertReset => "alert.reset",
        }
    }
}

impl std::fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully resolved values handed to notification templates.
pub type TemplateContext = serde_json::Map<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_parses_case_insensitively() {
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("fatal".parse::<Severity>().is_err());
    }

    #[test]
    fn notification_event_serializes_dotted_name() {
        let json = serde_json::to_string(&NotificationEvent::AlertReset).unwrap();
        assert_eq!(json, "\"alert.reset\"");
        assert_eq!(NotificationEvent::AlertTriggered.to_string(), "alert.triggered");
    }

    #[test]
    fn metric_sample_round_trips_through_json() {
        let sample = MetricSample::new("queue.wait_time", 1_000, 12.5);
        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains("\"metric_id\":\"queue.wait_time\""));
    }
}
