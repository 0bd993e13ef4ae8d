use thiserror::Error;

use crate::domain::persistence::PersistenceError;

/// Core error type for the Chronicle history engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed or missing required input; no persistence access was attempted
    #[error("BadRequestError{{Message: {0}}}")]
    BadRequest(String),

    /// Execution, run or pending task is absent or already resolved
    #[error("Entity not exists: {0}")]
    EntityNotExists(String),

    /// Task dispatch race lost to a different request id
    #[error("Event already started: {0}")]
    EventAlreadyStarted(String),

    /// Duplicate start or reuse-policy violation
    #[error("Workflow execution already started: {message} (run id: {run_id})")]
    WorkflowExecutionAlreadyStarted {
        /// Human readable reason
        message: String,
        /// Request id that created the conflicting run
        start_request_id: String,
        /// Run id of the conflicting run
        run_id: String,
    },

    /// Optimistic lock conflict reported by the store
    #[error("Condition failed: {0}")]
    ConditionFailed(String),

    /// Internal retry budget exhausted
    #[error("Maximum attempts exceeded to update history")]
    MaxAttemptsExceeded,

    /// An aggregate invariant would be violated
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Store or lock did not respond in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Shard range id no longer matches the store
    #[error("Shard ownership lost: {0}")]
    ShardOwnershipLost(String),

    /// Worker reported a failure while answering a query
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Store or engine failure that has no dedicated kind
    #[error("{0}")]
    Internal(String),
}

impl CoreError {
    /// True when the error is an optimistic-lock conflict
    #[inline]
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, CoreError::ConditionFailed(_))
    }

    /// True when the external layer may retry the whole operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ConditionFailed(_) | CoreError::MaxAttemptsExceeded | CoreError::Timeout(_)
        )
    }
}

impl From<PersistenceError> for CoreError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::EntityNotExists(msg) => CoreError::EntityNotExists(msg),
            PersistenceError::WorkflowExecutionAlreadyStarted(conflict) => {
                CoreError::WorkflowExecutionAlreadyStarted {
                    message: conflict.message,
                    start_request_id: conflict.start_request_id,
                    run_id: conflict.run_id,
                }
            }
            PersistenceError::ConditionFailed(msg) => CoreError::ConditionFailed(msg),
            PersistenceError::ShardOwnershipLost(msg) => CoreError::ShardOwnershipLost(msg),
            PersistenceError::Timeout(msg) => CoreError::Timeout(msg),
            PersistenceError::Internal(msg) => CoreError::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CoreError::Timeout("operation deadline exceeded".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::execution::WorkflowStatus;
    use crate::domain::persistence::AlreadyStartedConflict;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (CoreError::BadRequest("Missing domain UUID.".to_string()), "BadRequestError{Message: Missing domain UUID.}"),
            (CoreError::EntityNotExists("run".to_string()), "Entity not exists: run"),
            (CoreError::EventAlreadyStarted("decision".to_string()), "Event already started: decision"),
            (CoreError::ConditionFailed("stale".to_string()), "Condition failed: stale"),
            (CoreError::MaxAttemptsExceeded, "Maximum attempts exceeded to update history"),
            (CoreError::Timeout("store".to_string()), "Timeout: store"),
            (CoreError::Internal("boom".to_string()), "boom"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_from_persistence_error_keeps_conflict_details() {
        let err: CoreError = PersistenceError::WorkflowExecutionAlreadyStarted(AlreadyStartedConflict {
            message: "exists".to_string(),
            start_request_id: "req".to_string(),
            run_id: "run-1".to_string(),
            status: WorkflowStatus::Running,
            last_write_version: -24,
        })
        .into();

        match err {
            CoreError::WorkflowExecutionAlreadyStarted { run_id, start_request_id, .. } => {
                assert_eq!(run_id, "run-1");
                assert_eq!(start_request_id, "req");
            }
            other => panic!("Expected WorkflowExecutionAlreadyStarted, got {:?}", other),
        }
    }

    #[test]
    fn test_condition_failed_classification() {
        let err: CoreError = PersistenceError::ConditionFailed("next event id mismatch".to_string()).into();
        assert!(err.is_condition_failed());
        assert!(err.is_retryable());
        assert!(!CoreError::InvalidStateTransition("x".to_string()).is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();

        match error {
            CoreError::SerializationError(msg) => {
                assert!(msg.contains("expected value"));
            }
            _ => panic!("Expected SerializationError variant"),
        }
    }
}
