//! Error types for the enrichflow engine.
//!
//! The taxonomy separates programming/data-integrity errors (invalid
//! transitions), expected concurrency outcomes (idempotency collisions),
//! and infrastructure failures that abort a whole batch cycle.

use thiserror::Error;

use crate::status::StatusCode;

/// Error raised when a proposed status transition is not in the graph.
///
/// This is a programming or data-integrity error, never retried. The
/// message enumerates the valid next states so operators can see why an
/// item is stuck.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct InvalidTransitionError {
    /// Human-readable description including the valid next states.
    pub message: String,
    /// The current status.
    pub from: StatusCode,
    /// The rejected target status.
    pub to: StatusCode,
    /// Valid next states from `from` (manual edges included if requested).
    pub valid_next: Vec<StatusCode>,
}

/// Error raised when a step's idempotency key is already claimed by a
/// running attempt.
///
/// Expected under concurrent claims of the same item; callers treat it as
/// "skip, try next cycle" rather than a failure.
#[derive(Debug, Clone, Error)]
#[error("step '{step_name}' is already running for item {item_id} (key {key})")]
pub struct IdempotencyCollisionError {
    /// The colliding idempotency key.
    pub key: String,
    /// The step being attempted.
    pub step_name: String,
    /// The work item id.
    pub item_id: uuid::Uuid,
}

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A status transition outside the configured graphs.
    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransitionError),

    /// A concurrent attempt already holds the step's idempotency key.
    #[error("{0}")]
    IdempotencyCollision(#[from] IdempotencyCollisionError),

    /// A status name was requested that the registry does not know.
    #[error("unknown status '{0}'")]
    UnknownStatus(String),

    /// The backing store cannot be reached or rejected a write.
    ///
    /// Aborts the whole batch cycle and is surfaced to the scheduler.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    /// A run or step record that must exist is missing.
    #[error("missing record: {0}")]
    MissingRecord(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display_includes_message() {
        let err = InvalidTransitionError {
            message: "Invalid state transition: SUMMARIZING (211) -> PUBLISHED (400)".to_string(),
            from: StatusCode(211),
            to: StatusCode(400),
            valid_next: vec![StatusCode(220)],
        };
        assert!(err.to_string().contains("SUMMARIZING"));
        assert!(err.to_string().contains("400"));
    }

    #[test]
    fn test_collision_display() {
        let err = IdempotencyCollisionError {
            key: "abc:summarize:1".to_string(),
            step_name: "summarize".to_string(),
            item_id: uuid::Uuid::nil(),
        };
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn test_engine_error_from_transition() {
        let inner = InvalidTransitionError {
            message: "bad".to_string(),
            from: StatusCode(100),
            to: StatusCode(400),
            valid_next: vec![],
        };
        let err = EngineError::from(inner);
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }
}
