//! Exactly-once step execution keyed on `{item_id}:{step_name}:{attempt}`.
//!
//! The executor is the single place step runs are created and closed. A
//! stored success under the key is served back without re-running the
//! step; an open attempt under the key means another worker holds the
//! item and the caller backs off until the next cycle.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{EngineError, IdempotencyCollisionError};
use crate::model::{idempotency_key, StepStatus};
use crate::step::{StepError, StepOutcome};
use crate::store::{NewStepRun, RunStore, StepClose, StoreError};
use crate::tracker::error_signature;

/// Identifies the attempt an execution runs under.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// Owning pipeline run.
    pub run_id: Uuid,
    /// The work item.
    pub item_id: Uuid,
    /// Stage name.
    pub step_name: String,
    /// Attempt number allocated by the caller.
    pub attempt: u32,
    /// Inputs recorded on the step run.
    pub input_snapshot: Value,
}

/// What the executor produced for an attempt.
#[derive(Debug, Clone)]
pub enum StepExecution {
    /// A previously stored success was served without running the step.
    Cached {
        /// The stored output.
        output: Value,
        /// The attempt the cached success belongs to.
        attempt: u32,
    },
    /// The step ran and produced an output.
    Completed {
        /// Step output.
        output: Value,
        /// Attempt number.
        attempt: u32,
        /// Closed step run id.
        step_run_id: Uuid,
    },
    /// The step ran and rejected the item.
    Skipped {
        /// Rejection reason.
        reason: String,
        /// Attempt number.
        attempt: u32,
        /// Closed step run id.
        step_run_id: Uuid,
    },
}

impl StepExecution {
    /// The output value, for outcomes that carry one.
    #[must_use]
    pub fn output(&self) -> Option<&Value> {
        match self {
            Self::Cached { output, .. } | Self::Completed { output, .. } => Some(output),
            Self::Skipped { .. } => None,
        }
    }

    /// True when the outcome was served from a stored success.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached { .. })
    }
}

/// Why an execution did not produce a [`StepExecution`].
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Another worker holds an open attempt under the same key.
    #[error("{0}")]
    Collision(#[from] IdempotencyCollisionError),

    /// The step function failed; the step run is already closed.
    #[error("step '{step_name}' failed on attempt {attempt}: {error}")]
    Step {
        /// The original step error, preserved for classification.
        error: StepError,
        /// Stage name.
        step_name: String,
        /// Attempt number.
        attempt: u32,
        /// The failed step run.
        step_run_id: Uuid,
    },

    /// A store operation failed mid-execution.
    #[error("{0}")]
    Engine(#[from] EngineError),
}

impl From<StoreError> for ExecutionError {
    fn from(err: StoreError) -> Self {
        Self::Engine(err.into())
    }
}

/// Runs step functions under idempotency-key protection.
#[derive(Clone)]
pub struct IdempotencyExecutor {
    runs: Arc<dyn RunStore>,
}

impl IdempotencyExecutor {
    /// Creates an executor over a run store.
    #[must_use]
    pub fn new(runs: Arc<dyn RunStore>) -> Self {
        Self { runs }
    }

    /// Executes a step exactly once for the given attempt.
    ///
    /// Checks for a stored success under the attempt's idempotency key
    /// first; on a hit the step function never runs. Otherwise opens a
    /// running step run, invokes the step, and closes the record with
    /// the outcome. Failures are recorded and re-raised unchanged so the
    /// caller can classify them.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::Collision`] when the key is already claimed by
    /// an open attempt, [`ExecutionError::Step`] when the step function
    /// failed, [`ExecutionError::Engine`] for store failures.
    pub async fn execute<F, Fut>(
        &self,
        req: ExecuteRequest,
        step: F,
    ) -> Result<StepExecution, ExecutionError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<StepOutcome, StepError>> + Send,
    {
        let key = idempotency_key(req.item_id, &req.step_name, req.attempt);

        if let Some(done) = self.runs.find_success_by_key(&key).await? {
            debug!(
                key,
                step_run_id = %done.id,
                "serving cached step output, skipping execution"
            );
            return Ok(StepExecution::Cached {
                output: done.output.unwrap_or(Value::Null),
                attempt: req.attempt,
            });
        }

        let step_run = match self
            .runs
            .insert_step(NewStepRun {
                run_id: req.run_id,
                item_id: req.item_id,
                step_name: req.step_name.clone(),
                attempt: req.attempt,
                input_snapshot: req.input_snapshot,
            })
            .await
        {
            Ok(step_run) => step_run,
            Err(StoreError::DuplicateKey { key }) => {
                return Err(ExecutionError::Collision(IdempotencyCollisionError {
                    key,
                    step_name: req.step_name,
                    item_id: req.item_id,
                }));
            }
            Err(other) => return Err(other.into()),
        };

        match step().await {
            Ok(StepOutcome::Output(output)) => {
                self.runs
                    .close_step(
                        step_run.id,
                        StepClose {
                            status: StepStatus::Success,
                            output: Some(output.clone()),
                            error_message: None,
                            error_signature: None,
                        },
                    )
                    .await?;
                Ok(StepExecution::Completed {
                    output,
                    attempt: req.attempt,
                    step_run_id: step_run.id,
                })
            }
            Ok(StepOutcome::Rejected { reason }) => {
                self.runs
                    .close_step(
                        step_run.id,
                        StepClose {
                            status: StepStatus::Skipped,
                            output: None,
                            error_message: Some(reason.clone()),
                            error_signature: None,
                        },
                    )
                    .await?;
                Ok(StepExecution::Skipped {
                    reason,
                    attempt: req.attempt,
                    step_run_id: step_run.id,
                })
            }
            Err(error) => {
                self.runs
                    .close_step(
                        step_run.id,
                        StepClose {
                            status: StepStatus::Failed,
                            output: None,
                            error_message: Some(error.to_string()),
                            error_signature: Some(error_signature(&error.to_string())),
                        },
                    )
                    .await?;
                Err(ExecutionError::Step {
                    error,
                    step_name: req.step_name,
                    attempt: req.attempt,
                    step_run_id: step_run.id,
                })
            }
        }
    }
}
