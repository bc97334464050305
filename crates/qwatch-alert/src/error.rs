/// Errors produced by the alerting core.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Alert: invalid rule: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Alert: rule not found (id={0})")]
    RuleNotFound(String),

    #[error("Alert: rule already exists (id={0})")]
    RuleExists(String),

    #[error("Alert: alert not found (id={0})")]
    AlertNotFound(String),

    #[error("Alert: metric not registered (id={0})")]
    MetricNotFound(String),

    #[error("Alert: store unavailable: {0}")]
    Store(String),

    #[error("Alert: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Alert: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, AlertError>;
