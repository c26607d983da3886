//! Run lifecycle tracking and error-signature normalization.
//!
//! The tracker guarantees exactly one open [`PipelineRun`] per item and
//! closes runs when the orchestrator reaches a terminal outcome. Closing
//! is best-effort: the run log is observability data, and a tracking
//! write failure must never undo the item transition it describes.

use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::warn;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::model::{PipelineRun, RunStatus, RunTrigger, WorkItem};
use crate::store::{ItemStore, RunStore};

/// Maximum length of a normalized error signature.
const SIGNATURE_MAX_LEN: usize = 100;

fn uuid_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    RE.get_or_init(|| {
        Regex::new("[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
            .expect("uuid pattern is valid")
    })
}

fn number_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    RE.get_or_init(|| Regex::new(r"\d+").expect("number pattern is valid"))
}

/// Normalizes an error message into a grouping signature.
///
/// Lowercases, replaces UUIDs with `<uuid>` and digit runs with `<n>`,
/// and truncates to 100 characters, so `"Timeout fetching item 42"` and
/// `"timeout fetching item 7"` group under the same signature.
#[must_use]
pub fn error_signature(message: &str) -> String {
    let lowered = message.trim().to_lowercase();
    let without_uuids = uuid_pattern().replace_all(&lowered, "<uuid>");
    let normalized = number_pattern().replace_all(&without_uuids, "<n>");
    normalized.chars().take(SIGNATURE_MAX_LEN).collect()
}

/// Ensures run records exist and closes them at terminal outcomes.
#[derive(Clone)]
pub struct RunTracker {
    items: Arc<dyn ItemStore>,
    runs: Arc<dyn RunStore>,
}

impl RunTracker {
    /// Creates a tracker over the two stores.
    #[must_use]
    pub fn new(items: Arc<dyn ItemStore>, runs: Arc<dyn RunStore>) -> Self {
        Self { items, runs }
    }

    /// Returns the item's open run, creating one if none is open.
    ///
    /// Reuses the run referenced by `current_run_id` when it is still
    /// running, so an item retried mid-pipeline keeps accumulating step
    /// runs under the same episode. A new run derives its trigger from
    /// the item's entry type.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Infrastructure`] when the stores fail.
    pub async fn ensure_run(&self, item: &WorkItem) -> Result<PipelineRun, EngineError> {
        if let Some(run_id) = item.current_run_id {
            if let Some(run) = self.runs.get_run(run_id).await? {
                if run.status == RunStatus::Running {
                    return Ok(run);
                }
            }
        }

        let run = PipelineRun {
            id: Uuid::new_v4(),
            item_id: item.id,
            trigger: RunTrigger::from_entry_type(&item.entry_type),
            status: RunStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
            replay_validation: None,
            replay_performed_at: None,
        };
        self.runs.insert_run(run.clone()).await?;
        self.items.set_current_run(item.id, run.id).await?;
        Ok(run)
    }

    /// The attempt number the next execution of a step should use.
    ///
    /// Reuses the latest attempt when it already succeeded (the executor
    /// will then serve the cached output under the same idempotency key);
    /// otherwise allocates the next gap-free number.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Infrastructure`] when the run store fails.
    pub async fn resume_attempt(&self, run_id: Uuid, step_name: &str) -> Result<u32, EngineError> {
        let latest = self.runs.latest_step(run_id, step_name).await?;
        Ok(match latest {
            None => 1,
            Some(step) if step.status == crate::model::StepStatus::Success => step.attempt,
            Some(step) => step.attempt + 1,
        })
    }

    /// Closes a run with a terminal status, best-effort.
    ///
    /// A failed close is logged and swallowed; the item's own status is
    /// the source of truth and has already moved.
    pub async fn close_run(&self, run_id: Uuid, status: RunStatus) {
        if let Err(err) = self.runs.close_run(run_id, status, Utc::now()).await {
            warn!(%run_id, %status, error = %err, "failed to close pipeline run");
        }
    }
}
