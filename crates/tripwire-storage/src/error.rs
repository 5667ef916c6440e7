/// Errors that can occur within the storage layer.
///
/// Every mutating store call is a single atomic operation, so a returned
/// error means the call had no effect.
///
/// # Examples
///
/// ```rust
/// use tripwire_storage::error::StorageError;
///
/// let err = StorageError::Unavailable("connection refused".to_string());
/// assert!(err.to_string().contains("connection refused"));
/// assert!(err.is_unavailable());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backing store cannot be reached at all.
    #[error("Storage: backing store unavailable: {0}")]
    Unavailable(String),

    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failure of a stored record.
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored timestamp is outside the representable range.
    #[error("Storage: invalid timestamp {0} in column '{1}'")]
    InvalidTimestamp(i64, &'static str),

    /// Generic storage error for cases not covered by other variants.
    #[error("Storage: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether the error means the store is unreachable rather than that a
    /// single operation failed.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StorageError::Unavailable(_) => true,
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
