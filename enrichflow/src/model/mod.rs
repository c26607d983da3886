//! Persistent records flowing through the engine.
//!
//! [`WorkItem`] is owned by the item store; the engine only reads and
//! patches specific fields. [`PipelineRun`] and [`StepRun`] form the
//! append-only event log the replay engine folds over. [`JobRecord`] is
//! the polling-friendly progress surface for one batch cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::status::StatusCode;

/// What started a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// Operator-submitted item.
    Manual,
    /// Automated discovery (RSS, sitemap, crawl, anything non-manual).
    Discovery,
}

impl RunTrigger {
    /// Derives the trigger from a work item's entry type.
    ///
    /// `manual` maps to [`RunTrigger::Manual`]; every other entry type is
    /// discovery.
    #[must_use]
    pub fn from_entry_type(entry_type: &str) -> Self {
        if entry_type == "manual" {
            Self::Manual
        } else {
            Self::Discovery
        }
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Discovery => write!(f, "discovery"),
        }
    }
}

/// Lifecycle state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is in progress.
    Running,
    /// Run finished successfully.
    Completed,
    /// Run ended in failure (e.g. dead-letter promotion).
    Failed,
    /// Run was cancelled.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Attempt is in progress.
    Running,
    /// Attempt succeeded.
    Success,
    /// Attempt failed.
    Failed,
    /// Step function rejected the item (business skip, not an error).
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Scope of a typed status override attached to a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideScope {
    /// Re-run one isolated step, then jump to the target status.
    SingleStep,
    /// Run the remaining pipeline; the final step lands on the target.
    FullPipeline,
}

/// Explicit next-status override, e.g. a partial re-enrich that must
/// return the item to `PENDING_REVIEW` instead of continuing the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOverride {
    /// Status to land on when the override applies.
    pub target_status: StatusCode,
    /// Whether the override applies after this step or after the final one.
    pub scope: OverrideScope,
}

/// The unit of work flowing through the pipeline.
///
/// Created and deleted by discovery/review collaborators; the engine only
/// transitions its status and patches bookkeeping fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Item id.
    pub id: Uuid,
    /// Current pipeline status.
    pub status: StatusCode,
    /// Active pipeline run, if one is open.
    pub current_run_id: Option<Uuid>,
    /// Consecutive failures on `last_failed_step`.
    pub failure_count: u32,
    /// Step name of the most recent failure.
    pub last_failed_step: Option<String>,
    /// Normalized signature of the most recent error, for grouping.
    pub last_error_signature: Option<String>,
    /// Truncated human-readable message of the most recent error.
    pub last_error_message: Option<String>,
    /// Classification kind of the most recent error (`retryable` etc.).
    pub last_error_kind: Option<String>,
    /// Whether the most recent error was considered retryable.
    pub last_error_retryable: Option<bool>,
    /// How the item entered the system; drives the run trigger.
    pub entry_type: String,
    /// Agent-owned payload accumulated across steps.
    pub payload: Value,
    /// Earliest instant the item may be picked up again after a failure.
    pub retry_after: Option<DateTime<Utc>>,
    /// Typed next-status override for re-runs.
    pub step_override: Option<StepOverride>,
}

impl WorkItem {
    /// Creates a fresh item at the given status.
    #[must_use]
    pub fn new(status: StatusCode, entry_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status,
            current_run_id: None,
            failure_count: 0,
            last_failed_step: None,
            last_error_signature: None,
            last_error_message: None,
            last_error_kind: None,
            last_error_retryable: None,
            entry_type: entry_type.into(),
            payload: Value::Object(serde_json::Map::new()),
            retry_after: None,
            step_override: None,
        }
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Attaches a status override.
    #[must_use]
    pub fn with_override(mut self, step_override: StepOverride) -> Self {
        self.step_override = Some(step_override);
        self
    }
}

/// Field-level patch applied together with a status transition.
///
/// Only the set fields are written; everything else is left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemPatch {
    /// Replacement payload.
    pub payload: Option<Value>,
    /// New retry-after timestamp.
    pub retry_after: Option<DateTime<Utc>>,
    /// Clear the retry-after timestamp.
    #[serde(default)]
    pub clear_retry_after: bool,
    /// Clear the step override (consumed by the step it applied to).
    #[serde(default)]
    pub clear_override: bool,
    /// Clear the active run reference (run closed).
    #[serde(default)]
    pub clear_current_run: bool,
    /// Reset the consecutive-failure bookkeeping after a success.
    #[serde(default)]
    pub clear_failure_streak: bool,
}

impl ItemPatch {
    /// Creates an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the replacement payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the retry-after timestamp.
    #[must_use]
    pub fn with_retry_after(mut self, at: DateTime<Utc>) -> Self {
        self.retry_after = Some(at);
        self
    }

    /// Clears the retry-after timestamp.
    #[must_use]
    pub fn clearing_retry_after(mut self) -> Self {
        self.clear_retry_after = true;
        self
    }

    /// Clears the step override.
    #[must_use]
    pub fn clearing_override(mut self) -> Self {
        self.clear_override = true;
        self
    }

    /// Clears the active run reference.
    #[must_use]
    pub fn clearing_current_run(mut self) -> Self {
        self.clear_current_run = true;
        self
    }

    /// Resets the consecutive-failure bookkeeping.
    #[must_use]
    pub fn clearing_failure_streak(mut self) -> Self {
        self.clear_failure_streak = true;
        self
    }

    /// True if the patch writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
            && self.retry_after.is_none()
            && !self.clear_retry_after
            && !self.clear_override
            && !self.clear_current_run
            && !self.clear_failure_streak
    }
}

/// Failure bookkeeping persisted on the work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Consecutive same-step failure count after this failure.
    pub failure_count: u32,
    /// The step that failed.
    pub step_name: String,
    /// Normalized error signature for grouping.
    pub error_signature: String,
    /// Truncated human-readable message.
    pub error_message: String,
    /// Classification kind as a stable string (`retryable` etc.).
    pub error_kind: String,
    /// Whether the classification considered the error retryable.
    pub retryable: bool,
}

/// One processing episode of a work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run id.
    pub id: Uuid,
    /// The work item this run belongs to.
    pub item_id: Uuid,
    /// What started the run.
    pub trigger: RunTrigger,
    /// Lifecycle state.
    pub status: RunStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Completion timestamp, once closed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Validation outcome of the last recorded replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_validation: Option<Value>,
    /// When that replay was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_performed_at: Option<DateTime<Utc>>,
}

/// One attempt of one pipeline stage within a run.
///
/// Created at step start, closed exactly once, never mutated after
/// closing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    /// Step run id.
    pub id: Uuid,
    /// Owning pipeline run.
    pub run_id: Uuid,
    /// Stage name, e.g. `summarize`.
    pub step_name: String,
    /// Attempt number, 1-based and gap-free per `(run_id, step_name)`.
    pub attempt: u32,
    /// Outcome state.
    pub status: StepStatus,
    /// Deterministic `{item_id}:{step_name}:{attempt}` key.
    pub idempotency_key: String,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// Close timestamp, once terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Snapshot of the inputs the attempt saw.
    pub input_snapshot: Value,
    /// Step output on success.
    pub output: Option<Value>,
    /// Error message on failure (or skip reason).
    pub error_message: Option<String>,
    /// Normalized error signature on failure.
    pub error_signature: Option<String>,
}

/// Builds the deterministic idempotency key for a step attempt.
#[must_use]
pub fn idempotency_key(item_id: Uuid, step_name: &str, attempt: u32) -> String {
    format!("{item_id}:{step_name}:{attempt}")
}

/// Lifecycle state of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Cycle in progress.
    Running,
    /// Cycle finished.
    Completed,
    /// Cycle aborted or reclaimed as stale.
    Failed,
}

/// Progress record for one batch cycle of one stage.
///
/// Counters are updated after every item so an external monitor always
/// sees near-real-time progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id.
    pub id: Uuid,
    /// Stage the job belongs to.
    pub stage: String,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// Completion timestamp, once finalized.
    pub completed_at: Option<DateTime<Utc>>,
    /// Items handled so far.
    pub processed_items: u32,
    /// Items that succeeded.
    pub success_count: u32,
    /// Items that failed.
    pub failed_count: u32,
    /// Item currently being processed.
    pub current_item_id: Option<Uuid>,
    /// Short label of the current item, for dashboards.
    pub current_item_label: Option<String>,
    /// Failure description when the job did not complete.
    pub error_message: Option<String>,
}

impl JobRecord {
    /// Creates a running job for a stage.
    #[must_use]
    pub fn start(stage: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage: stage.into(),
            status: JobStatus::Running,
            started_at: now,
            completed_at: None,
            processed_items: 0,
            success_count: 0,
            failed_count: 0,
            current_item_id: None,
            current_item_label: None,
            error_message: None,
        }
    }
}
