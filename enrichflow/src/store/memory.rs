//! In-memory store implementations.
//!
//! Reference implementations for tests and single-process embedders. The
//! uniqueness and compare-and-set semantics a relational backend would
//! enforce with constraints are enforced here under one mutex per store,
//! so concurrent callers observe the same guarantees.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::model::{
    idempotency_key, FailureRecord, ItemPatch, JobRecord, JobStatus, PipelineRun, RunStatus,
    StepRun, StepStatus, WorkItem,
};
use crate::status::StatusCode;

use super::{
    ItemStore, JobStore, JobUpdate, NewStepRun, RunFilter, RunStore, StepClose, StoreError,
};

/// In-memory [`ItemStore`].
#[derive(Debug, Default)]
pub struct InMemoryItemStore {
    items: Mutex<Vec<WorkItem>>,
}

impl InMemoryItemStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True if no items are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

fn apply_patch(item: &mut WorkItem, patch: ItemPatch) {
    if let Some(payload) = patch.payload {
        item.payload = payload;
    }
    if let Some(at) = patch.retry_after {
        item.retry_after = Some(at);
    }
    if patch.clear_retry_after {
        item.retry_after = None;
    }
    if patch.clear_override {
        item.step_override = None;
    }
    if patch.clear_current_run {
        item.current_run_id = None;
    }
    if patch.clear_failure_streak {
        item.failure_count = 0;
        item.last_failed_step = None;
        item.last_error_signature = None;
        item.last_error_message = None;
        item.last_error_kind = None;
        item.last_error_retryable = None;
    }
}

#[async_trait]
impl ItemStore for InMemoryItemStore {
    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>, StoreError> {
        Ok(self.items.lock().iter().find(|item| item.id == id).cloned())
    }

    async fn insert(&self, item: WorkItem) -> Result<(), StoreError> {
        let mut items = self.items.lock();
        if items.iter().any(|existing| existing.id == item.id) {
            return Err(StoreError::DuplicateKey {
                key: item.id.to_string(),
            });
        }
        items.push(item);
        Ok(())
    }

    async fn find_ready(
        &self,
        ready: StatusCode,
        working: StatusCode,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.items.lock();
        Ok(items
            .iter()
            .filter(|item| {
                item.status == ready
                    || (item.status == working
                        && item.retry_after.is_some_and(|at| at <= now))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self, status: StatusCode) -> Result<usize, StoreError> {
        Ok(self
            .items
            .lock()
            .iter()
            .filter(|item| item.status == status)
            .count())
    }

    async fn count_in_flight(
        &self,
        working: StatusCode,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        Ok(self
            .items
            .lock()
            .iter()
            .filter(|item| {
                item.status == working && item.retry_after.map_or(true, |at| at > now)
            })
            .count())
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: StatusCode,
        next: StatusCode,
        patch: ItemPatch,
    ) -> Result<WorkItem, StoreError> {
        let mut items = self.items.lock();
        let item = items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("item {id}")))?;

        if item.status != expected {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: item.status,
            });
        }

        item.status = next;
        apply_patch(item, patch);
        Ok(item.clone())
    }

    async fn set_current_run(&self, id: Uuid, run_id: Uuid) -> Result<(), StoreError> {
        let mut items = self.items.lock();
        let item = items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("item {id}")))?;
        item.current_run_id = Some(run_id);
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, record: &FailureRecord) -> Result<(), StoreError> {
        let mut items = self.items.lock();
        let item = items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("item {id}")))?;
        item.failure_count = record.failure_count;
        item.last_failed_step = Some(record.step_name.clone());
        item.last_error_signature = Some(record.error_signature.clone());
        item.last_error_message = Some(record.error_message.clone());
        item.last_error_kind = Some(record.error_kind.clone());
        item.last_error_retryable = Some(record.retryable);
        Ok(())
    }

    async fn reset_status(&self, from: StatusCode, to: StatusCode) -> Result<usize, StoreError> {
        let mut items = self.items.lock();
        let mut reset = 0;
        for item in items.iter_mut().filter(|item| item.status == from) {
            item.status = to;
            item.retry_after = None;
            reset += 1;
        }
        Ok(reset)
    }
}

#[derive(Debug, Default)]
struct RunStoreInner {
    runs: Vec<PipelineRun>,
    steps: Vec<StepRun>,
}

/// In-memory [`RunStore`].
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    inner: Mutex<RunStoreInner>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored step runs (test helper).
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.inner.lock().steps.len()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert_run(&self, run: PipelineRun) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.runs.iter().any(|existing| existing.id == run.id) {
            return Err(StoreError::DuplicateKey {
                key: run.id.to_string(),
            });
        }
        inner.runs.push(run);
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self.inner.lock().runs.iter().find(|run| run.id == id).cloned())
    }

    async fn close_run(
        &self,
        id: Uuid,
        status: RunStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        run.status = status;
        run.completed_at = Some(completed_at);
        Ok(())
    }

    async fn record_replay(
        &self,
        id: Uuid,
        validation: serde_json::Value,
        performed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        run.replay_validation = Some(validation);
        run.replay_performed_at = Some(performed_at);
        Ok(())
    }

    async fn insert_step(&self, new: NewStepRun) -> Result<StepRun, StoreError> {
        let key = idempotency_key(new.item_id, &new.step_name, new.attempt);
        let mut inner = self.inner.lock();

        if inner.steps.iter().any(|step| step.idempotency_key == key) {
            return Err(StoreError::DuplicateKey { key });
        }
        if inner.steps.iter().any(|step| {
            step.run_id == new.run_id
                && step.step_name == new.step_name
                && step.attempt == new.attempt
        }) {
            return Err(StoreError::DuplicateKey { key });
        }

        let step = StepRun {
            id: Uuid::new_v4(),
            run_id: new.run_id,
            step_name: new.step_name,
            attempt: new.attempt,
            status: StepStatus::Running,
            idempotency_key: key,
            started_at: Utc::now(),
            completed_at: None,
            input_snapshot: new.input_snapshot,
            output: None,
            error_message: None,
            error_signature: None,
        };
        inner.steps.push(step.clone());
        Ok(step)
    }

    async fn latest_step(
        &self,
        run_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepRun>, StoreError> {
        Ok(self
            .inner
            .lock()
            .steps
            .iter()
            .filter(|step| step.run_id == run_id && step.step_name == step_name)
            .max_by_key(|step| step.attempt)
            .cloned())
    }

    async fn find_success_by_key(&self, key: &str) -> Result<Option<StepRun>, StoreError> {
        Ok(self
            .inner
            .lock()
            .steps
            .iter()
            .find(|step| step.idempotency_key == key && step.status == StepStatus::Success)
            .cloned())
    }

    async fn close_step(&self, id: Uuid, close: StepClose) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let step = inner
            .steps
            .iter_mut()
            .find(|step| step.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("step run {id}")))?;
        // Closed step runs are immutable.
        if step.status != StepStatus::Running {
            return Err(StoreError::Conflict {
                id,
                expected: StatusCode(0),
                actual: StatusCode(0),
            });
        }
        step.status = close.status;
        step.completed_at = Some(Utc::now());
        step.output = close.output;
        step.error_message = close.error_message;
        step.error_signature = close.error_signature;
        Ok(())
    }

    async fn steps_for_run(&self, run_id: Uuid) -> Result<Vec<StepRun>, StoreError> {
        let mut steps: Vec<StepRun> = self
            .inner
            .lock()
            .steps
            .iter()
            .filter(|step| step.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|step| step.started_at);
        Ok(steps)
    }

    async fn sample_run_ids(
        &self,
        n: usize,
        filter: &RunFilter,
    ) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.lock();
        let mut ids: Vec<Uuid> = inner
            .runs
            .iter()
            .filter(|run| filter.status.map_or(true, |status| run.status == status))
            .filter(|run| filter.since.map_or(true, |since| run.created_at >= since))
            .map(|run| run.id)
            .collect();
        let mut rng = rand::thread_rng();
        ids.shuffle(&mut rng);
        ids.truncate(n);
        Ok(ids)
    }
}

/// In-memory [`JobStore`].
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<Vec<JobRecord>>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All jobs for a stage, newest last (test helper).
    #[must_use]
    pub fn jobs_for_stage(&self, stage: &str) -> Vec<JobRecord> {
        self.jobs
            .lock()
            .iter()
            .filter(|job| job.stage == stage)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: JobRecord) -> Result<(), StoreError> {
        self.jobs.lock().push(job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.lock().iter().find(|job| job.id == id).cloned())
    }

    async fn find_running(&self, stage: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .iter()
            .find(|job| job.stage == stage && job.status == JobStatus::Running)
            .cloned())
    }

    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        if let Some(status) = update.status {
            job.status = status;
        }
        if let Some(at) = update.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(processed) = update.processed_items {
            job.processed_items = processed;
        }
        if let Some(success) = update.success_count {
            job.success_count = success;
        }
        if let Some(failed) = update.failed_count {
            job.failed_count = failed;
        }
        if let Some(item_id) = update.current_item_id {
            job.current_item_id = Some(item_id);
        }
        if let Some(label) = update.current_item_label {
            job.current_item_label = Some(label);
        }
        if let Some(message) = update.error_message {
            job.error_message = Some(message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunTrigger;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn run_for(item_id: Uuid) -> PipelineRun {
        PipelineRun {
            id: Uuid::new_v4(),
            item_id,
            trigger: RunTrigger::Discovery,
            status: RunStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
            replay_validation: None,
            replay_performed_at: None,
        }
    }

    #[tokio::test]
    async fn test_update_status_cas_conflict() {
        let store = InMemoryItemStore::new();
        let item = WorkItem::new(StatusCode(210), "rss");
        let id = item.id;
        store.insert(item).await.unwrap();

        // Someone else already moved the item.
        store
            .update_status(id, StatusCode(210), StatusCode(211), ItemPatch::new())
            .await
            .unwrap();

        let err = store
            .update_status(id, StatusCode(210), StatusCode(211), ItemPatch::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: StatusCode(210),
                actual: StatusCode(211),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_find_ready_includes_retryable_working_items() {
        let store = InMemoryItemStore::new();
        let ready_item = WorkItem::new(StatusCode(210), "rss");
        let mut parked = WorkItem::new(StatusCode(211), "rss");
        parked.retry_after = Some(Utc::now() - chrono::Duration::seconds(5));
        let mut not_due = WorkItem::new(StatusCode(211), "rss");
        not_due.retry_after = Some(Utc::now() + chrono::Duration::seconds(300));
        let working_no_retry = WorkItem::new(StatusCode(211), "rss");

        for item in [&ready_item, &parked, &not_due, &working_no_retry] {
            store.insert(item.clone()).await.unwrap();
        }

        let found = store
            .find_ready(StatusCode(210), StatusCode(211), Utc::now(), 10)
            .await
            .unwrap();
        let ids: Vec<Uuid> = found.iter().map(|item| item.id).collect();
        assert!(ids.contains(&ready_item.id));
        assert!(ids.contains(&parked.id));
        assert!(!ids.contains(&not_due.id));
        assert!(!ids.contains(&working_no_retry.id));
    }

    #[tokio::test]
    async fn test_count_in_flight_ignores_due_parked_items() {
        let store = InMemoryItemStore::new();
        let active = WorkItem::new(StatusCode(211), "rss");
        let mut due = WorkItem::new(StatusCode(211), "rss");
        due.retry_after = Some(Utc::now() - chrono::Duration::seconds(5));
        let mut not_due = WorkItem::new(StatusCode(211), "rss");
        not_due.retry_after = Some(Utc::now() + chrono::Duration::seconds(300));

        for item in [active, due, not_due] {
            store.insert(item).await.unwrap();
        }

        assert_eq!(store.count_by_status(StatusCode(211)).await.unwrap(), 3);
        // The due item is claimable again and holds no WIP slot.
        assert_eq!(
            store
                .count_in_flight(StatusCode(211), Utc::now())
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_find_ready_respects_limit() {
        let store = InMemoryItemStore::new();
        for _ in 0..5 {
            store
                .insert(WorkItem::new(StatusCode(210), "rss"))
                .await
                .unwrap();
        }
        let found = store
            .find_ready(StatusCode(210), StatusCode(211), Utc::now(), 3)
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn test_reset_status_clears_retry_after() {
        let store = InMemoryItemStore::new();
        let mut stuck = WorkItem::new(StatusCode(211), "rss");
        stuck.retry_after = Some(Utc::now());
        store.insert(stuck).await.unwrap();
        store.insert(WorkItem::new(StatusCode(210), "rss")).await.unwrap();

        let reset = store
            .reset_status(StatusCode(211), StatusCode(210))
            .await
            .unwrap();
        assert_eq!(reset, 1);
        assert_eq!(store.count_by_status(StatusCode(210)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_step_rejects_duplicate_key() {
        let store = InMemoryRunStore::new();
        let item_id = Uuid::new_v4();
        let run = run_for(item_id);
        let run_id = run.id;
        store.insert_run(run).await.unwrap();

        let new = NewStepRun {
            run_id,
            item_id,
            step_name: "summarize".to_string(),
            attempt: 1,
            input_snapshot: json!({}),
        };
        store.insert_step(new.clone()).await.unwrap();
        let err = store.insert_step(new).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn test_close_step_is_terminal() {
        let store = InMemoryRunStore::new();
        let item_id = Uuid::new_v4();
        let run = run_for(item_id);
        let run_id = run.id;
        store.insert_run(run).await.unwrap();

        let step = store
            .insert_step(NewStepRun {
                run_id,
                item_id,
                step_name: "tag".to_string(),
                attempt: 1,
                input_snapshot: json!({}),
            })
            .await
            .unwrap();

        store
            .close_step(
                step.id,
                StepClose {
                    status: StepStatus::Success,
                    output: Some(json!({"ok": true})),
                    error_message: None,
                    error_signature: None,
                },
            )
            .await
            .unwrap();

        let err = store
            .close_step(
                step.id,
                StepClose {
                    status: StepStatus::Failed,
                    output: None,
                    error_message: Some("late".to_string()),
                    error_signature: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_steps_for_run_ordered_by_started_at() {
        let store = InMemoryRunStore::new();
        let item_id = Uuid::new_v4();
        let run = run_for(item_id);
        let run_id = run.id;
        store.insert_run(run).await.unwrap();

        for (step_name, attempt) in [("summarize", 1), ("summarize", 2), ("tag", 1)] {
            store
                .insert_step(NewStepRun {
                    run_id,
                    item_id,
                    step_name: step_name.to_string(),
                    attempt,
                    input_snapshot: json!({}),
                })
                .await
                .unwrap();
        }

        let steps = store.steps_for_run(run_id).await.unwrap();
        assert_eq!(steps.len(), 3);
        for pair in steps.windows(2) {
            assert!(pair[0].started_at <= pair[1].started_at);
        }
    }

    #[tokio::test]
    async fn test_sample_run_ids_filters_by_status() {
        let store = InMemoryRunStore::new();
        let mut completed = run_for(Uuid::new_v4());
        completed.status = RunStatus::Completed;
        let completed_id = completed.id;
        store.insert_run(completed).await.unwrap();
        store.insert_run(run_for(Uuid::new_v4())).await.unwrap();

        let filter = RunFilter {
            status: Some(RunStatus::Completed),
            since: None,
        };
        let ids = store.sample_run_ids(10, &filter).await.unwrap();
        assert_eq!(ids, vec![completed_id]);
    }

    #[tokio::test]
    async fn test_job_store_single_running_lookup() {
        let store = InMemoryJobStore::new();
        let job = JobRecord::start("summarizer", Utc::now());
        let job_id = job.id;
        store.insert(job).await.unwrap();

        let found = store.find_running("summarizer").await.unwrap().unwrap();
        assert_eq!(found.id, job_id);
        assert!(store.find_running("tagger").await.unwrap().is_none());

        store
            .update(job_id, JobUpdate::finalize(JobStatus::Completed, Utc::now()))
            .await
            .unwrap();
        assert!(store.find_running("summarizer").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_progress_update() {
        let store = InMemoryJobStore::new();
        let job = JobRecord::start("tagger", Utc::now());
        let job_id = job.id;
        store.insert(job).await.unwrap();

        store
            .update(job_id, JobUpdate::progress(3, 2, 1))
            .await
            .unwrap();
        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.processed_items, 3);
        assert_eq!(job.success_count, 2);
        assert_eq!(job.failed_count, 1);
    }
}
