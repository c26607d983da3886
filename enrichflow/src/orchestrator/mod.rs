//! The batch control loop: one cycle per stage per scheduler tick.
//!
//! A cycle reclaims stale jobs, checks admission, claims a bounded batch
//! of ready items and drives each item through the state machine, the
//! tracker and the idempotency executor, classifying failures as it
//! goes. One item's failure never aborts the batch; only infrastructure
//! failures do.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, WipLimits};
use crate::classify::{classify, next_failure_count, should_dead_letter, BackoffConfig};
use crate::errors::EngineError;
use crate::idempotency::{ExecuteRequest, ExecutionError, IdempotencyExecutor, StepExecution};
use crate::model::{
    FailureRecord, ItemPatch, JobRecord, JobStatus, OverrideScope, PipelineRun, RunStatus,
    WorkItem,
};
use crate::status::{StateMachine, StatusCode};
use crate::step::{StepError, StepFunction};
use crate::store::{ItemStore, JobStore, JobUpdate, RunStore, StoreError};
use crate::tracker::{error_signature, RunTracker};


/// Longest error message persisted on an item.
const ERROR_MESSAGE_MAX_LEN: usize = 1_000;

/// Longest item label shown on job records.
const LABEL_MAX_LEN: usize = 100;

/// Computes a successful step's next status from the item.
pub type NextStatusFn = dyn Fn(&WorkItem) -> StatusCode + Send + Sync;

/// Builds the item patch applied with a successful transition.
pub type PayloadPatchFn = dyn Fn(&WorkItem, &Value) -> ItemPatch + Send + Sync;

/// One stage's wiring: the statuses it moves items between and the
/// execution deadline for its step function.
#[derive(Clone)]
pub struct StageConfig {
    /// Stage name, also the job record's stage key.
    pub name: String,
    /// Step name recorded on step runs. Defaults to the stage name.
    pub step_name: String,
    /// Status items wait at before this stage.
    pub ready: StatusCode,
    /// Status items hold while this stage processes them.
    pub working: StatusCode,
    /// Status a successful step moves items to.
    pub success: StatusCode,
    /// Custom next-status hook; replaces `success` when set. An item's
    /// `StepOverride` still takes precedence.
    pub next_status: Option<Arc<NextStatusFn>>,
    /// Custom patch hook; replaces the default merge of the output into
    /// the payload under the step name.
    pub payload_patch: Option<Arc<PayloadPatchFn>>,
    /// Quarantine status for exhausted or terminal failures.
    pub dead_letter: StatusCode,
    /// True for the last stage of the pipeline; closes the run.
    pub is_final: bool,
    /// Step execution deadline.
    pub timeout: Duration,
}

impl StageConfig {
    /// Creates a stage with the default deadline and dead-letter status.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        ready: StatusCode,
        working: StatusCode,
        success: StatusCode,
    ) -> Self {
        let name = name.into();
        Self {
            step_name: name.clone(),
            name,
            ready,
            working,
            success,
            next_status: None,
            payload_patch: None,
            dead_letter: StatusCode(599),
            is_final: false,
            timeout: Duration::from_secs(90),
        }
    }

    /// Installs a custom next-status hook.
    #[must_use]
    pub fn with_next_status(
        mut self,
        hook: impl Fn(&WorkItem) -> StatusCode + Send + Sync + 'static,
    ) -> Self {
        self.next_status = Some(Arc::new(hook));
        self
    }

    /// Installs a custom payload-patch hook.
    #[must_use]
    pub fn with_payload_patch(
        mut self,
        hook: impl Fn(&WorkItem, &Value) -> ItemPatch + Send + Sync + 'static,
    ) -> Self {
        self.payload_patch = Some(Arc::new(hook));
        self
    }

    /// Overrides the step name recorded on step runs.
    #[must_use]
    pub fn with_step_name(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = step_name.into();
        self
    }

    /// Overrides the dead-letter status.
    #[must_use]
    pub fn with_dead_letter(mut self, status: StatusCode) -> Self {
        self.dead_letter = status;
        self
    }

    /// Marks this as the pipeline's final stage.
    #[must_use]
    pub fn final_stage(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Overrides the step execution deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Cycle-level knobs shared by all stages of one orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Age past which a running job is considered abandoned.
    pub stale_after: ChronoDuration,
    /// Maximum items claimed per cycle, before WIP capacity.
    pub batch_limit: usize,
    /// Retry backoff parameters.
    pub backoff: BackoffConfig,
    /// Per-stage WIP limits.
    pub limits: WipLimits,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stale_after: ChronoDuration::minutes(30),
            batch_limit: 10,
            backoff: BackoffConfig::default(),
            limits: WipLimits::new(),
        }
    }
}

/// What one batch cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The cycle did not claim work.
    Skipped {
        /// Why the cycle was skipped.
        reason: String,
    },
    /// The cycle processed a batch.
    Completed {
        /// Items iterated, including skips.
        processed: u32,
        /// Items that progressed.
        succeeded: u32,
        /// Items that failed (parked or dead-lettered).
        failed: u32,
    },
}

enum ItemOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Drives one stage's batch cycles.
pub struct BatchOrchestrator {
    stage: StageConfig,
    step: Arc<dyn StepFunction>,
    items: Arc<dyn ItemStore>,
    jobs: Arc<dyn JobStore>,
    machine: StateMachine,
    tracker: RunTracker,
    executor: IdempotencyExecutor,
    admission: AdmissionController,
    config: OrchestratorConfig,
}

impl BatchOrchestrator {
    /// Wires an orchestrator for one stage over the three stores.
    #[must_use]
    pub fn new(
        stage: StageConfig,
        step: Arc<dyn StepFunction>,
        items: Arc<dyn ItemStore>,
        runs: Arc<dyn RunStore>,
        jobs: Arc<dyn JobStore>,
        machine: StateMachine,
        config: OrchestratorConfig,
    ) -> Self {
        let tracker = RunTracker::new(items.clone(), runs.clone());
        let executor = IdempotencyExecutor::new(runs);
        let admission = AdmissionController::new(items.clone(), config.limits.clone());
        Self {
            stage,
            step,
            items,
            jobs,
            machine,
            tracker,
            executor,
            admission,
            config,
        }
    }

    /// The stage this orchestrator drives.
    #[must_use]
    pub fn stage(&self) -> &StageConfig {
        &self.stage
    }

    /// Runs one batch cycle.
    ///
    /// Single-flight per stage: a non-stale running job skips the cycle,
    /// a stale one is marked failed and its stuck working items are reset
    /// to ready before this cycle proceeds.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Infrastructure`] when the stores fail at
    /// the cycle level. Per-item failures are absorbed into counters.
    pub async fn run_cycle(&self) -> Result<BatchOutcome, EngineError> {
        let now = Utc::now();
        if let Some(job) = self.jobs.find_running(&self.stage.name).await? {
            if now - job.started_at < self.config.stale_after {
                debug!(stage = %self.stage.name, job_id = %job.id, "stage job still running, skipping cycle");
                return Ok(BatchOutcome::Skipped {
                    reason: "stage job already running".to_string(),
                });
            }
            let mut reclaim = JobUpdate::finalize(JobStatus::Failed, now);
            reclaim.error_message = Some("reclaimed as stale".to_string());
            self.jobs.update(job.id, reclaim).await?;
            let reset = self
                .items
                .reset_status(self.stage.working, self.stage.ready)
                .await?;
            warn!(
                stage = %self.stage.name,
                job_id = %job.id,
                reset,
                "reclaimed stale job and reset stuck items"
            );
        }

        let capacity = self
            .admission
            .capacity(&self.stage.name, self.stage.working, now)
            .await?;
        if capacity.available == 0 {
            debug!(
                stage = %self.stage.name,
                current = capacity.current,
                limit = capacity.limit,
                "wip limit reached, skipping cycle"
            );
            return Ok(BatchOutcome::Skipped {
                reason: format!("wip limit reached ({}/{})", capacity.current, capacity.limit),
            });
        }

        let limit = capacity.available.min(self.config.batch_limit);
        let batch = self
            .items
            .find_ready(self.stage.ready, self.stage.working, Utc::now(), limit)
            .await?;
        if batch.is_empty() {
            return Ok(BatchOutcome::Skipped {
                reason: "no ready items".to_string(),
            });
        }

        let job = JobRecord::start(self.stage.name.clone(), Utc::now());
        let job_id = job.id;
        self.jobs.insert(job).await?;
        info!(stage = %self.stage.name, batch = batch.len(), %job_id, "starting batch cycle");

        let mut processed = 0u32;
        let mut succeeded = 0u32;
        let mut failed = 0u32;

        for item in batch {
            let mut cursor = JobUpdate::new();
            cursor.current_item_id = Some(item.id);
            cursor.current_item_label = item
                .payload
                .get("title")
                .and_then(Value::as_str)
                .map(|title| title.chars().take(LABEL_MAX_LEN).collect());
            self.jobs.update(job_id, cursor).await?;

            match self.process_item(&item).await {
                Ok(ItemOutcome::Succeeded) => succeeded += 1,
                Ok(ItemOutcome::Failed) => failed += 1,
                Ok(ItemOutcome::Skipped) => {}
                Err(EngineError::Infrastructure(message)) => {
                    let mut abort = JobUpdate::finalize(JobStatus::Failed, Utc::now());
                    abort.error_message = Some(message.clone());
                    if let Err(err) = self.jobs.update(job_id, abort).await {
                        warn!(%job_id, error = %err, "failed to mark aborted job");
                    }
                    return Err(EngineError::Infrastructure(message));
                }
                Err(err) => {
                    error!(item_id = %item.id, error = %err, "item processing failed");
                    failed += 1;
                }
            }
            processed += 1;
            self.jobs
                .update(job_id, JobUpdate::progress(processed, succeeded, failed))
                .await?;
        }

        self.jobs
            .update(job_id, JobUpdate::finalize(JobStatus::Completed, Utc::now()))
            .await?;
        info!(
            stage = %self.stage.name,
            processed,
            succeeded,
            failed,
            "batch cycle finished"
        );
        Ok(BatchOutcome::Completed {
            processed,
            succeeded,
            failed,
        })
    }

    async fn process_item(&self, item: &WorkItem) -> Result<ItemOutcome, EngineError> {
        let run = self.tracker.ensure_run(item).await?;
        let attempt = self
            .tracker
            .resume_attempt(run.id, &self.stage.step_name)
            .await?;

        self.machine
            .validate_transition(item.status, self.stage.working, false)?;
        let claimed = match self
            .items
            .update_status(item.id, item.status, self.stage.working, ItemPatch::new())
            .await
        {
            Ok(claimed) => claimed,
            Err(StoreError::Conflict { .. }) => {
                debug!(item_id = %item.id, "item claimed by another worker");
                return Ok(ItemOutcome::Skipped);
            }
            Err(other) => return Err(other.into()),
        };

        let request = ExecuteRequest {
            run_id: run.id,
            item_id: claimed.id,
            step_name: self.stage.step_name.clone(),
            attempt,
            input_snapshot: claimed.payload.clone(),
        };
        let step = Arc::clone(&self.step);
        let step_item = claimed.clone();
        let deadline = self.stage.timeout;
        let step_name = self.stage.step_name.clone();
        let execution = self
            .executor
            .execute(request, move || async move {
                match tokio::time::timeout(deadline, step.execute(&step_item)).await {
                    Ok(result) => result,
                    Err(_) => {
                        #[allow(clippy::cast_possible_truncation)]
                        Err(StepError::timeout(&step_name, deadline.as_millis() as u64))
                    }
                }
            })
            .await;

        match execution {
            Ok(StepExecution::Skipped { reason, .. }) => {
                info!(item_id = %claimed.id, reason, "step rejected item, progression unchanged");
                Ok(ItemOutcome::Skipped)
            }
            Ok(execution) => {
                let cached = execution.is_cached();
                let output = execution.output().cloned().unwrap_or(Value::Null);
                self.finish_success(&claimed, &run, output, cached).await
            }
            Err(ExecutionError::Collision(err)) => {
                debug!(item_id = %claimed.id, error = %err, "attempt already running elsewhere");
                Ok(ItemOutcome::Skipped)
            }
            Err(ExecutionError::Step { error, .. }) => {
                self.handle_failure(&claimed, &run, &error).await
            }
            Err(ExecutionError::Engine(err)) => Err(err),
        }
    }

    /// The status a successful step should land on, and whether that
    /// consumes the item's override (which also ends the episode).
    fn next_status_for(&self, item: &WorkItem) -> (StatusCode, bool) {
        if let Some(ov) = item.step_override {
            match ov.scope {
                OverrideScope::SingleStep => return (ov.target_status, true),
                OverrideScope::FullPipeline if self.stage.is_final => {
                    return (ov.target_status, true)
                }
                OverrideScope::FullPipeline => {}
            }
        }
        if let Some(hook) = &self.stage.next_status {
            return (hook(item), false);
        }
        (self.stage.success, false)
    }

    async fn finish_success(
        &self,
        item: &WorkItem,
        run: &PipelineRun,
        output: Value,
        cached: bool,
    ) -> Result<ItemOutcome, EngineError> {
        let (next, consumed_override) = self.next_status_for(item);
        // Override targets may sit behind manual edges.
        self.machine
            .validate_transition(item.status, next, consumed_override)?;

        let base = match &self.stage.payload_patch {
            Some(hook) => hook(item, &output),
            None => {
                let mut payload = match item.payload.clone() {
                    Value::Object(map) => map,
                    _ => serde_json::Map::new(),
                };
                payload.insert(self.stage.step_name.clone(), output);
                ItemPatch::new().with_payload(Value::Object(payload))
            }
        };

        let closes_run = self.stage.is_final || consumed_override;
        let mut patch = base.clearing_retry_after().clearing_failure_streak();
        if consumed_override {
            patch = patch.clearing_override();
        }
        if closes_run {
            patch = patch.clearing_current_run();
        }

        match self.items.update_status(item.id, item.status, next, patch).await {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => {
                warn!(item_id = %item.id, "lost status race after successful step");
                return Ok(ItemOutcome::Skipped);
            }
            Err(other) => return Err(other.into()),
        }

        if closes_run {
            self.tracker.close_run(run.id, RunStatus::Completed).await;
        }
        info!(
            item_id = %item.id,
            next = %next,
            cached,
            step = %self.stage.step_name,
            "step succeeded"
        );
        Ok(ItemOutcome::Succeeded)
    }

    async fn handle_failure(
        &self,
        item: &WorkItem,
        run: &PipelineRun,
        error: &StepError,
    ) -> Result<ItemOutcome, EngineError> {
        let classification = classify(error);
        let failure_count = next_failure_count(item, &self.stage.step_name);
        let message = error.to_string();
        let record = FailureRecord {
            failure_count,
            step_name: self.stage.step_name.clone(),
            error_signature: error_signature(&message),
            error_message: message.chars().take(ERROR_MESSAGE_MAX_LEN).collect(),
            error_kind: classification.kind.as_str().to_string(),
            retryable: classification.retryable,
        };
        self.items.record_failure(item.id, &record).await?;

        if should_dead_letter(&classification, failure_count) {
            self.machine
                .validate_transition(self.stage.working, self.stage.dead_letter, false)?;
            let patch = ItemPatch::new().clearing_retry_after().clearing_current_run();
            match self
                .items
                .update_status(item.id, self.stage.working, self.stage.dead_letter, patch)
                .await
            {
                Ok(_) => {}
                Err(StoreError::Conflict { .. }) => return Ok(ItemOutcome::Skipped),
                Err(other) => return Err(other.into()),
            }
            self.tracker.close_run(run.id, RunStatus::Failed).await;
            warn!(
                item_id = %item.id,
                step = %self.stage.step_name,
                failure_count,
                reason = classification.reason,
                "item promoted to dead letter"
            );
        } else {
            let delay = self.config.backoff.delay(classification.kind, failure_count);
            let retry_at = Utc::now()
                + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(60));
            let patch = ItemPatch::new().with_retry_after(retry_at);
            match self
                .items
                .update_status(item.id, self.stage.working, self.stage.working, patch)
                .await
            {
                Ok(_) => {}
                Err(StoreError::Conflict { .. }) => return Ok(ItemOutcome::Skipped),
                Err(other) => return Err(other.into()),
            }
            info!(
                item_id = %item.id,
                step = %self.stage.step_name,
                failure_count,
                retry_at = %retry_at,
                reason = classification.reason,
                "item parked for retry"
            );
        }
        Ok(ItemOutcome::Failed)
    }
}
