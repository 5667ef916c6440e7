use tripwire_common::types::TriggerState;
use tripwire_storage::error::StorageError;

/// The lease store could not be consulted. The caller skips the trigger for
/// this cycle.
///
/// # Examples
///
/// ```rust
/// use tripwire_checker::error::LockError;
/// use tripwire_storage::error::StorageError;
///
/// let err = LockError::CoordinationUnavailable {
///     trigger_id: "t1".to_string(),
///     source: StorageError::Unavailable("connection refused".to_string()),
/// };
/// assert!(err.to_string().contains("t1"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Checker: lock coordination unavailable for trigger '{trigger_id}': {source}")]
    CoordinationUnavailable {
        trigger_id: String,
        #[source]
        source: StorageError,
    },
}

/// Reasons a trigger cannot be evaluated. Each one puts the trigger into
/// [`TriggerState::Exception`] with the error text as the check message.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("failed to fetch metrics: {0}")]
    Fetch(#[from] StorageError),

    #[error("trigger has no targets")]
    NoTargets,

    #[error("metric '{metric}' has non-finite value {value}")]
    InvalidValue { metric: String, value: f64 },

    /// Conditions can only move a metric into WARN or ERROR.
    #[error("condition targets state {0}, expected WARN or ERROR")]
    InvalidCondition(TriggerState),
}
