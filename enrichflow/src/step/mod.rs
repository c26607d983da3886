//! The step function contract implemented by the agent layer.
//!
//! The engine never looks inside a step; it only needs the outcome shape
//! and, on failure, the [`ClassifiableError`] capability the classifier
//! inspects.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

use crate::model::WorkItem;

/// Result of a successful step function invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step produced an output payload.
    Output(Value),
    /// The step rejected the item: bad data, not an error. The item's
    /// progression is left exactly where it is.
    Rejected {
        /// Why the item was rejected.
        reason: String,
    },
}

impl StepOutcome {
    /// Convenience constructor for an output outcome.
    #[must_use]
    pub fn output(value: Value) -> Self {
        Self::Output(value)
    }

    /// Convenience constructor for a rejection.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Capability interface the error classifier inspects.
///
/// Adapter code constructs a [`StepError`] from whatever the underlying
/// HTTP/LLM client throws; the classifier only ever sees this surface.
pub trait ClassifiableError {
    /// Human-readable message.
    fn message(&self) -> &str;

    /// Client-specific error code, e.g. `ETIMEDOUT`.
    fn code(&self) -> Option<&str>;

    /// HTTP status code, when the failure came from an HTTP response.
    fn http_status(&self) -> Option<u16>;
}

/// Error raised by a step function.
#[derive(Debug, Clone)]
pub struct StepError {
    message: String,
    code: Option<String>,
    http_status: Option<u16>,
}

impl StepError {
    /// Creates an error with a message only.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            http_status: None,
        }
    }

    /// Sets the client error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Sets the HTTP status.
    #[must_use]
    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// A step deadline expiry, classified as retryable.
    #[must_use]
    pub fn timeout(step_name: &str, after_ms: u64) -> Self {
        Self::new(format!("step '{step_name}' timed out after {after_ms}ms"))
            .with_code("ETIMEDOUT")
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepError {}

impl ClassifiableError for StepError {
    fn message(&self) -> &str {
        &self.message
    }

    fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    fn http_status(&self) -> Option<u16> {
        self.http_status
    }
}

/// One pipeline stage's business logic (summarizer, tagger, ...).
///
/// Implemented outside the engine; invoked through the idempotency
/// executor under a deadline.
#[async_trait]
pub trait StepFunction: Send + Sync {
    /// Executes the step against a work item.
    async fn execute(&self, item: &WorkItem) -> Result<StepOutcome, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_builder() {
        let err = StepError::new("upstream said no")
            .with_code("E_NOPE")
            .with_http_status(503);
        assert_eq!(err.message(), "upstream said no");
        assert_eq!(err.code(), Some("E_NOPE"));
        assert_eq!(err.http_status(), Some(503));
    }

    #[test]
    fn test_timeout_error_shape() {
        let err = StepError::timeout("summarize", 90_000);
        assert!(err.message().contains("timed out"));
        assert_eq!(err.code(), Some("ETIMEDOUT"));
        assert_eq!(err.http_status(), None);
    }

    #[test]
    fn test_outcome_constructors() {
        assert_eq!(
            StepOutcome::rejected("not an article"),
            StepOutcome::Rejected {
                reason: "not an article".to_string()
            }
        );
        assert!(matches!(
            StepOutcome::output(serde_json::json!(1)),
            StepOutcome::Output(_)
        ));
    }
}
