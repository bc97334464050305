use qwatch_alert::AlertError;

/// Errors that can occur within the storage layer.
///
/// # Examples
///
/// ```rust
/// use qwatch_storage::error::StorageError;
///
/// let err = StorageError::NotFound {
///     entity: "rule",
///     id: "rule-99".to_string(),
/// };
/// assert!(err.to_string().contains("rule-99"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A required record was not found in the database.
    #[error("Storage: {entity} not found (id={id})")]
    NotFound { entity: &'static str, id: String },

    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failure of a stored document.
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage: I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking worker running a database call panicked or was cancelled.
    #[error("Storage: background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Generic storage error for cases not covered by other variants.
    #[error("Storage: {0}")]
    Other(String),
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

impl From<StorageError> for AlertError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { entity: "rule", id } => AlertError::RuleNotFound(id),
            StorageError::NotFound { entity: "alert", id } => AlertError::AlertNotFound(id),
            other => AlertError::Store(other.to_string()),
        }
    }
}
