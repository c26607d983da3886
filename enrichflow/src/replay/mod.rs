//! Event-log replay: reconstructs run histories and proves the log is
//! complete enough to audit every run without re-executing side effects.
//!
//! Reconstruction is a pure fold over a [`PipelineRun`] and its
//! [`StepRun`]s ordered by `started_at`. No step function is ever
//! invoked here.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::model::{PipelineRun, StepRun, StepStatus};
use crate::store::{RunFilter, RunStore};

/// One reconstructed event in a run's state history.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayEvent {
    /// Event name: `pipeline_started`, `step_started`, `step_success`,
    /// `step_failed`, `step_skipped`, `pipeline_completed`.
    pub name: String,
    /// When the event happened.
    pub at: DateTime<Utc>,
    /// The step the event belongs to, for step events.
    pub step_name: Option<String>,
    /// The attempt the event belongs to, for step events.
    pub attempt: Option<u32>,
}

impl ReplayEvent {
    fn pipeline(name: &str, at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            at,
            step_name: None,
            attempt: None,
        }
    }

    fn step(name: String, at: DateTime<Utc>, step: &StepRun) -> Self {
        Self {
            name,
            at,
            step_name: Some(step.step_name.clone()),
            attempt: Some(step.attempt),
        }
    }
}

/// Outcome of validating one reconstructed history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayValidation {
    /// Violations that flip the run's replay to failed.
    pub errors: Vec<String>,
    /// Degradations worth surfacing but not failures.
    pub warnings: Vec<String>,
}

impl ReplayValidation {
    /// True when no errors were found (warnings allowed).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Replay result for one run.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    /// The replayed run.
    pub run_id: Uuid,
    /// True when every validation check held.
    pub success: bool,
    /// The reconstructed state history.
    pub events: Vec<ReplayEvent>,
    /// Validation details.
    pub validation: ReplayValidation,
}

/// Aggregate result for a batch replay.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayBatchReport {
    /// Runs replayed.
    pub total: usize,
    /// Runs whose validation held.
    pub successful: usize,
    /// `successful / total` as a percentage; 100 for an empty batch.
    pub success_rate: f64,
    /// Per-run reports.
    pub reports: Vec<ReplayReport>,
}

/// Reconstructs and validates a run's history from its records.
///
/// Pure; exposed separately from [`ReplayEngine`] so histories can be
/// checked against hand-built records.
#[must_use]
pub fn replay_records(run: &PipelineRun, steps: &[StepRun]) -> ReplayReport {
    let mut events = vec![ReplayEvent::pipeline("pipeline_started", run.created_at)];
    let mut validation = ReplayValidation::default();

    for step in steps {
        events.push(ReplayEvent::step(
            "step_started".to_string(),
            step.started_at,
            step,
        ));
        match (step.status, step.completed_at) {
            (StepStatus::Running, _) | (_, None) => {
                validation.errors.push(format!(
                    "step '{}' attempt {} has no terminal event",
                    step.step_name, step.attempt
                ));
            }
            (status, Some(at)) => {
                events.push(ReplayEvent::step(format!("step_{status}"), at, step));
                match status {
                    StepStatus::Success if step.output.is_none() => {
                        validation.warnings.push(format!(
                            "step '{}' attempt {} succeeded without output",
                            step.step_name, step.attempt
                        ));
                    }
                    StepStatus::Failed if step.error_message.is_none() => {
                        validation.warnings.push(format!(
                            "step '{}' attempt {} failed without error message",
                            step.step_name, step.attempt
                        ));
                    }
                    _ => {}
                }
            }
        }
    }

    // Open runs get the reconstruction time as their terminal marker so
    // every history ends with a pipeline_completed event.
    events.push(ReplayEvent::pipeline(
        "pipeline_completed",
        run.completed_at.unwrap_or_else(Utc::now),
    ));

    let step_events = events
        .iter()
        .filter(|event| event.name.starts_with("step_"))
        .count();
    if step_events != 2 * steps.len() {
        validation.errors.push(format!(
            "expected {} step events, reconstructed {step_events}",
            2 * steps.len()
        ));
    }

    for pair in events.windows(2) {
        if pair[1].at < pair[0].at {
            validation.errors.push(format!(
                "event '{}' precedes '{}' in time",
                pair[1].name, pair[0].name
            ));
        }
    }

    ReplayReport {
        run_id: run.id,
        success: validation.is_valid(),
        events,
        validation,
    }
}

/// Replays persisted runs from a run store.
#[derive(Clone)]
pub struct ReplayEngine {
    runs: Arc<dyn RunStore>,
}

impl ReplayEngine {
    /// Creates an engine over a run store.
    #[must_use]
    pub fn new(runs: Arc<dyn RunStore>) -> Self {
        Self { runs }
    }

    /// Replays one run.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingRecord`] for unknown run ids and
    /// [`EngineError::Infrastructure`] when the store fails. Validation
    /// failures are reported in the result, never raised.
    pub async fn replay_run(&self, run_id: Uuid) -> Result<ReplayReport, EngineError> {
        let run = self
            .runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::MissingRecord(format!("run {run_id}")))?;
        let steps = self.runs.steps_for_run(run_id).await?;
        Ok(replay_records(&run, &steps))
    }

    /// Replays one run and records the validation outcome on it.
    ///
    /// [`ReplayEngine::replay_run`] is the simulation path and writes
    /// nothing; this variant additionally persists the validation and
    /// the replay timestamp through the run store, so dashboards can
    /// show when a run was last audited.
    ///
    /// # Errors
    ///
    /// Everything [`ReplayEngine::replay_run`] raises, plus
    /// [`EngineError::Infrastructure`] when the write fails.
    pub async fn replay_and_record(&self, run_id: Uuid) -> Result<ReplayReport, EngineError> {
        let report = self.replay_run(run_id).await?;
        let validation = serde_json::to_value(&report.validation)?;
        self.runs
            .record_replay(run_id, validation, Utc::now())
            .await?;
        Ok(report)
    }

    /// Replays a set of runs and aggregates the success rate.
    ///
    /// # Errors
    ///
    /// Propagates the first store failure; validation failures only
    /// lower the rate.
    pub async fn replay_batch(&self, run_ids: &[Uuid]) -> Result<ReplayBatchReport, EngineError> {
        let mut reports = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            reports.push(self.replay_run(*run_id).await?);
        }
        let total = reports.len();
        let successful = reports.iter().filter(|report| report.success).count();
        #[allow(clippy::cast_precision_loss)]
        let success_rate = if total == 0 {
            100.0
        } else {
            (successful as f64 / total as f64) * 100.0
        };
        Ok(ReplayBatchReport {
            total,
            successful,
            success_rate,
            reports,
        })
    }

    /// Replays a random sample of runs matching the filter.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn sample_and_replay(
        &self,
        n: usize,
        filter: &RunFilter,
    ) -> Result<ReplayBatchReport, EngineError> {
        let ids = self.runs.sample_run_ids(n, filter).await?;
        self.replay_batch(&ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{idempotency_key, RunStatus, RunTrigger};
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn run_at(created_at: DateTime<Utc>) -> PipelineRun {
        PipelineRun {
            id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            trigger: RunTrigger::Discovery,
            status: RunStatus::Completed,
            created_at,
            completed_at: None,
            replay_validation: None,
            replay_performed_at: None,
        }
    }

    fn step_at(
        run: &PipelineRun,
        step_name: &str,
        attempt: u32,
        status: StepStatus,
        started_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> StepRun {
        StepRun {
            id: Uuid::new_v4(),
            run_id: run.id,
            step_name: step_name.to_string(),
            attempt,
            status,
            idempotency_key: idempotency_key(run.item_id, step_name, attempt),
            started_at,
            completed_at,
            input_snapshot: json!({}),
            output: matches!(status, StepStatus::Success).then(|| json!({"ok": true})),
            error_message: matches!(status, StepStatus::Failed).then(|| "boom".to_string()),
            error_signature: None,
        }
    }

    #[test]
    fn test_complete_run_replays_successfully() {
        let t0 = Utc::now();
        let mut run = run_at(t0);
        run.completed_at = Some(t0 + Duration::seconds(30));
        let steps = vec![
            step_at(
                &run,
                "summarize",
                1,
                StepStatus::Failed,
                t0 + Duration::seconds(1),
                Some(t0 + Duration::seconds(5)),
            ),
            step_at(
                &run,
                "summarize",
                2,
                StepStatus::Success,
                t0 + Duration::seconds(10),
                Some(t0 + Duration::seconds(20)),
            ),
        ];

        let report = replay_records(&run, &steps);
        assert!(report.success, "{:?}", report.validation);
        let names: Vec<&str> = report.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "pipeline_started",
                "step_started",
                "step_failed",
                "step_started",
                "step_success",
                "pipeline_completed"
            ]
        );
    }

    #[test]
    fn test_running_step_is_a_completeness_violation() {
        let t0 = Utc::now();
        let run = run_at(t0);
        let steps = vec![step_at(
            &run,
            "tag",
            1,
            StepStatus::Running,
            t0 + Duration::seconds(1),
            None,
        )];

        let report = replay_records(&run, &steps);
        assert!(!report.success);
        assert!(report
            .validation
            .errors
            .iter()
            .any(|err| err.contains("no terminal event")));
    }

    #[test]
    fn test_missing_output_is_warning_only() {
        let t0 = Utc::now();
        let run = run_at(t0);
        let mut step = step_at(
            &run,
            "tag",
            1,
            StepStatus::Success,
            t0 + Duration::seconds(1),
            Some(t0 + Duration::seconds(2)),
        );
        step.output = None;

        let report = replay_records(&run, &[step]);
        assert!(report.success);
        assert_eq!(report.validation.warnings.len(), 1);
        assert!(report.validation.warnings[0].contains("without output"));
    }

    #[test]
    fn test_chronology_violation_fails() {
        let t0 = Utc::now();
        let mut run = run_at(t0);
        // Run closed before its only step finished.
        run.completed_at = Some(t0 + Duration::seconds(1));
        let steps = vec![step_at(
            &run,
            "tag",
            1,
            StepStatus::Success,
            t0 + Duration::seconds(2),
            Some(t0 + Duration::seconds(5)),
        )];

        let report = replay_records(&run, &steps);
        assert!(!report.success);
        assert!(report
            .validation
            .errors
            .iter()
            .any(|err| err.contains("precedes")));
    }

    #[test]
    fn test_empty_run_is_valid() {
        let report = replay_records(&run_at(Utc::now()), &[]);
        assert!(report.success);
        let names: Vec<&str> = report.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["pipeline_started", "pipeline_completed"]);
    }

    #[test]
    fn test_open_run_gets_terminal_marker() {
        let t0 = Utc::now();
        let run = run_at(t0);
        let steps = vec![step_at(
            &run,
            "tag",
            1,
            StepStatus::Success,
            t0 + Duration::seconds(1),
            Some(t0 + Duration::seconds(2)),
        )];

        let report = replay_records(&run, &steps);
        assert!(report.success, "{:?}", report.validation);
        assert_eq!(report.events.len(), 2 * steps.len() + 2);
        let last = report.events.last().unwrap();
        assert_eq!(last.name, "pipeline_completed");
        assert!(last.at >= t0 + Duration::seconds(2));
    }

    #[tokio::test]
    async fn test_batch_success_rate() {
        use crate::store::{InMemoryRunStore, NewStepRun, StepClose};

        let store = Arc::new(InMemoryRunStore::new());
        let engine = ReplayEngine::new(store.clone());

        // One clean run.
        let good = run_at(Utc::now());
        store.insert_run(good.clone()).await.unwrap();
        let step = store
            .insert_step(NewStepRun {
                run_id: good.id,
                item_id: good.item_id,
                step_name: "summarize".to_string(),
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

        // One run with a dangling running step.
        let bad = run_at(Utc::now());
        store.insert_run(bad.clone()).await.unwrap();
        store
            .insert_step(NewStepRun {
                run_id: bad.id,
                item_id: bad.item_id,
                step_name: "summarize".to_string(),
                attempt: 1,
                input_snapshot: json!({}),
            })
            .await
            .unwrap();

        let report = engine.replay_batch(&[good.id, bad.id]).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.successful, 1);
        assert!((report.success_rate - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_replay_and_record_persists_validation() {
        use crate::store::{InMemoryRunStore, NewStepRun, StepClose};

        let store = Arc::new(InMemoryRunStore::new());
        let engine = ReplayEngine::new(store.clone());

        let mut run = run_at(Utc::now());
        run.completed_at = Some(Utc::now());
        let run_id = run.id;
        let item_id = run.item_id;
        store.insert_run(run).await.unwrap();
        let step = store
            .insert_step(NewStepRun {
                run_id,
                item_id,
                step_name: "summarize".to_string(),
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

        // The simulation path writes nothing.
        engine.replay_run(run_id).await.unwrap();
        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert!(run.replay_performed_at.is_none());

        let report = engine.replay_and_record(run_id).await.unwrap();
        assert!(report.success, "{:?}", report.validation);

        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert!(run.replay_performed_at.is_some());
        let validation = run.replay_validation.unwrap();
        assert_eq!(validation["errors"], json!([]));
        assert_eq!(validation["warnings"], json!([]));
    }

    #[tokio::test]
    async fn test_unknown_run_is_missing_record() {
        let engine = ReplayEngine::new(Arc::new(crate::store::InMemoryRunStore::new()));
        let err = engine.replay_run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingRecord(_)));
    }
}
