//! Storage contracts consumed by the engine.
//!
//! All coordination — single-flight per stage, exactly-once per attempt,
//! exactly-one-active-run-per-item — is expressed as storage-level
//! uniqueness and compare-and-set constraints, never as in-process locks,
//! because multiple orchestrator processes may run concurrently against
//! the same store.

mod memory;

pub use memory::{InMemoryItemStore, InMemoryJobStore, InMemoryRunStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    FailureRecord, ItemPatch, JobRecord, JobStatus, PipelineRun, RunStatus, StepRun, StepStatus,
    WorkItem,
};
use crate::status::StatusCode;

/// Errors surfaced by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A compare-and-set status update found a different current status.
    #[error("status conflict for item {id}: expected {expected}, found {actual}")]
    Conflict {
        /// The item whose update was rejected.
        id: Uuid,
        /// The status the caller expected.
        expected: StatusCode,
        /// The status actually stored.
        actual: StatusCode,
    },

    /// A uniqueness constraint rejected an insert.
    #[error("duplicate key: {key}")]
    DuplicateKey {
        /// The offending key.
        key: String,
    },

    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for crate::errors::EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::MissingRecord(what),
            other => Self::Infrastructure(other.to_string()),
        }
    }
}

/// Item store contract.
///
/// The engine reads and patches work items; creation and deletion belong
/// to discovery/review collaborators.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Loads one item.
    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>, StoreError>;

    /// Inserts an item (used by collaborators and tests).
    async fn insert(&self, item: WorkItem) -> Result<(), StoreError>;

    /// Items ready for a stage, up to `limit`.
    ///
    /// Matches items at the ready status, plus items parked at the working
    /// status whose `retry_after` has passed — the ready query is the
    /// retry queue.
    async fn find_ready(
        &self,
        ready: StatusCode,
        working: StatusCode,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Number of items at a status (WIP counting).
    async fn count_by_status(&self, status: StatusCode) -> Result<usize, StoreError>;

    /// Number of items actively held at a working status.
    ///
    /// Excludes parked items whose `retry_after` has passed: those are
    /// claimable again through [`ItemStore::find_ready`] and must not
    /// occupy WIP slots, or a stage full of due retries could never
    /// drain.
    async fn count_in_flight(
        &self,
        working: StatusCode,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Transitions an item's status, compare-and-set against `expected`.
    ///
    /// The patch is applied atomically with the transition. Returns the
    /// updated item.
    async fn update_status(
        &self,
        id: Uuid,
        expected: StatusCode,
        next: StatusCode,
        patch: ItemPatch,
    ) -> Result<WorkItem, StoreError>;

    /// Stores the active run id on an item.
    async fn set_current_run(&self, id: Uuid, run_id: Uuid) -> Result<(), StoreError>;

    /// Persists failure bookkeeping fields on an item.
    async fn record_failure(&self, id: Uuid, record: &FailureRecord) -> Result<(), StoreError>;

    /// Bulk-resets every item at `from` back to `to` (stale reclaim).
    ///
    /// Returns the number of items reset.
    async fn reset_status(&self, from: StatusCode, to: StatusCode) -> Result<usize, StoreError>;
}

/// Insert request for a new step run.
#[derive(Debug, Clone)]
pub struct NewStepRun {
    /// Owning pipeline run.
    pub run_id: Uuid,
    /// The work item, used to build the idempotency key.
    pub item_id: Uuid,
    /// Stage name.
    pub step_name: String,
    /// Attempt number the caller allocated.
    pub attempt: u32,
    /// Inputs the attempt will see.
    pub input_snapshot: Value,
}

/// Close request for a running step run.
#[derive(Debug, Clone)]
pub struct StepClose {
    /// Terminal status (`Success`, `Failed` or `Skipped`).
    pub status: StepStatus,
    /// Output, for successes.
    pub output: Option<Value>,
    /// Error message or skip reason.
    pub error_message: Option<String>,
    /// Normalized signature, for failures.
    pub error_signature: Option<String>,
}

/// Filter for sampling runs in batch replay.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Only runs at this status.
    pub status: Option<RunStatus>,
    /// Only runs created at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

/// Run/step event store contract.
///
/// Step inserts enforce uniqueness of both the idempotency key and the
/// `(run_id, step_name, attempt)` triple at the storage layer; this is
/// the real concurrency guard, not an in-process mutex.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts a pipeline run.
    async fn insert_run(&self, run: PipelineRun) -> Result<(), StoreError>;

    /// Loads one run.
    async fn get_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError>;

    /// Closes a run with a terminal status.
    async fn close_run(
        &self,
        id: Uuid,
        status: RunStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Stores a replay's validation outcome on the run.
    async fn record_replay(
        &self,
        id: Uuid,
        validation: Value,
        performed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Inserts a running step run.
    ///
    /// Fails with [`StoreError::DuplicateKey`] if the idempotency key or
    /// the attempt number is already taken.
    async fn insert_step(&self, new: NewStepRun) -> Result<StepRun, StoreError>;

    /// The highest-attempt step run for `(run_id, step_name)`, if any.
    async fn latest_step(
        &self,
        run_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepRun>, StoreError>;

    /// A successful step run stored under the given idempotency key.
    async fn find_success_by_key(&self, key: &str) -> Result<Option<StepRun>, StoreError>;

    /// Closes a running step run. Closed step runs are never mutated
    /// again.
    async fn close_step(&self, id: Uuid, close: StepClose) -> Result<(), StoreError>;

    /// All step runs of a run, ordered by `started_at`.
    async fn steps_for_run(&self, run_id: Uuid) -> Result<Vec<StepRun>, StoreError>;

    /// A random sample of run ids matching the filter.
    async fn sample_run_ids(&self, n: usize, filter: &RunFilter)
        -> Result<Vec<Uuid>, StoreError>;
}

/// Field-level update for a job record.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    /// New lifecycle status.
    pub status: Option<JobStatus>,
    /// Completion timestamp.
    pub completed_at: Option<DateTime<Utc>>,
    /// Items handled so far.
    pub processed_items: Option<u32>,
    /// Success counter.
    pub success_count: Option<u32>,
    /// Failure counter.
    pub failed_count: Option<u32>,
    /// Item currently being processed.
    pub current_item_id: Option<Uuid>,
    /// Short label of the current item.
    pub current_item_label: Option<String>,
    /// Failure description.
    pub error_message: Option<String>,
}

impl JobUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress counters after one item.
    #[must_use]
    pub fn progress(processed: u32, success: u32, failed: u32) -> Self {
        Self {
            processed_items: Some(processed),
            success_count: Some(success),
            failed_count: Some(failed),
            ..Self::default()
        }
    }

    /// Finalizes the job with a terminal status.
    #[must_use]
    pub fn finalize(status: JobStatus, completed_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            completed_at: Some(completed_at),
            ..Self::default()
        }
    }
}

/// Job record store contract (the polling surface for dashboards).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a job record.
    async fn insert(&self, job: JobRecord) -> Result<(), StoreError>;

    /// Loads one job.
    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError>;

    /// The running job for a stage, if one exists.
    async fn find_running(&self, stage: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Applies a field-level update.
    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<(), StoreError>;
}
