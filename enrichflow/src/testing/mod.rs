//! Canned step functions for exercising the engine without real agents.
//!
//! Used by the crate's own tests and exported for embedders writing
//! tests against their stage wiring.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::model::WorkItem;
use crate::step::{StepError, StepFunction, StepOutcome};

/// Always succeeds with a fixed output.
#[derive(Debug, Clone)]
pub struct StaticStep {
    output: Value,
}

impl StaticStep {
    /// Creates a step returning `output` on every call.
    #[must_use]
    pub fn new(output: Value) -> Self {
        Self { output }
    }
}

#[async_trait]
impl StepFunction for StaticStep {
    async fn execute(&self, _item: &WorkItem) -> Result<StepOutcome, StepError> {
        Ok(StepOutcome::output(self.output.clone()))
    }
}

/// Always rejects with a fixed reason.
#[derive(Debug, Clone)]
pub struct RejectingStep {
    reason: String,
}

impl RejectingStep {
    /// Creates a step rejecting every item with `reason`.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl StepFunction for RejectingStep {
    async fn execute(&self, _item: &WorkItem) -> Result<StepOutcome, StepError> {
        Ok(StepOutcome::rejected(self.reason.clone()))
    }
}

/// Fails the first `failures` calls with a fixed error, then succeeds.
#[derive(Debug)]
pub struct FlakyStep {
    failures: usize,
    calls: AtomicUsize,
    error: StepError,
    output: Value,
}

impl FlakyStep {
    /// Creates a step failing `failures` times before succeeding with
    /// `output`.
    #[must_use]
    pub fn new(failures: usize, error: StepError, output: Value) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
            error,
            output,
        }
    }

    /// Number of times the step has been invoked.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepFunction for FlakyStep {
    async fn execute(&self, _item: &WorkItem) -> Result<StepOutcome, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(self.error.clone())
        } else {
            Ok(StepOutcome::output(self.output.clone()))
        }
    }
}

/// Never completes; exercises the step deadline.
#[derive(Debug, Clone, Copy)]
pub struct PendingStep;

#[async_trait]
impl StepFunction for PendingStep {
    async fn execute(&self, _item: &WorkItem) -> Result<StepOutcome, StepError> {
        std::future::pending().await
    }
}

/// Fails items whose payload flags it, succeeds for the rest.
///
/// Fails when `payload[key]` is `true`, otherwise succeeds with the
/// fixed output. Lets one batch mix failing and succeeding items.
#[derive(Debug, Clone)]
pub struct PayloadSwitchStep {
    key: String,
    error: StepError,
    output: Value,
}

impl PayloadSwitchStep {
    /// Creates the switch over payload field `key`.
    #[must_use]
    pub fn new(key: impl Into<String>, error: StepError, output: Value) -> Self {
        Self {
            key: key.into(),
            error,
            output,
        }
    }
}

#[async_trait]
impl StepFunction for PayloadSwitchStep {
    async fn execute(&self, item: &WorkItem) -> Result<StepOutcome, StepError> {
        if item.payload.get(&self.key).and_then(Value::as_bool) == Some(true) {
            Err(self.error.clone())
        } else {
            Ok(StepOutcome::output(self.output.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_flaky_step_recovers() {
        let step = FlakyStep::new(2, StepError::new("boom"), json!({"ok": true}));
        let item = WorkItem::new(StatusCode(210), "rss");

        assert!(step.execute(&item).await.is_err());
        assert!(step.execute(&item).await.is_err());
        assert!(step.execute(&item).await.is_ok());
        assert_eq!(step.calls(), 3);
    }

    #[tokio::test]
    async fn test_payload_switch() {
        let step = PayloadSwitchStep::new("fail", StepError::new("boom"), json!({}));
        let failing = WorkItem::new(StatusCode(210), "rss").with_payload(json!({"fail": true}));
        let passing = WorkItem::new(StatusCode(210), "rss").with_payload(json!({"fail": false}));

        assert!(step.execute(&failing).await.is_err());
        assert!(step.execute(&passing).await.is_ok());
    }
}
