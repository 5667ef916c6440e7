use tripwire_storage::error::StorageError;

/// Outcome of a failed delivery attempt, as reported by a [`crate::Sender`].
///
/// # Examples
///
/// ```rust
/// use tripwire_notify::error::SendError;
///
/// let err = SendError::Transient("upstream returned 503".to_string());
/// assert!(err.is_transient());
/// assert!(!SendError::Permanent("bad address".to_string()).is_transient());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// A retry may succeed (network failure, rate limit, upstream 5xx).
    #[error("Notify: transient delivery failure: {0}")]
    Transient(String),

    /// Retrying cannot help (malformed address, rejected request).
    #[error("Notify: permanent delivery failure: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

/// Errors of the fan-out and delivery loops.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The sender configuration names a type no sender implements.
    #[error("Notify: unknown sender type '{0}'")]
    UnknownSenderType(String),

    #[error("Notify: failed to initialize sender '{sender}': {source}")]
    SenderInit {
        sender: String,
        #[source]
        source: SendError,
    },
}

impl NotifyError {
    /// Whether the failure came from an unreachable store.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, NotifyError::Storage(e) if e.is_unavailable())
    }
}

/// Convenience `Result` alias for the notification subsystem.
pub type Result<T> = std::result::Result<T, NotifyError>;
