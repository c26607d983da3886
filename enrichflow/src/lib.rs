//! # Enrichflow
//!
//! A pipeline orchestration engine for multi-stage content enrichment.
//!
//! Enrichflow drives work items through a chain of agent-owned steps
//! (fetch, summarize, tag, thumbnail, ...) with:
//!
//! - **A configurable status state machine**: named numeric codes with
//!   normal and manual transition graphs, validated on every move
//! - **Exactly-once step execution**: deterministic idempotency keys and
//!   storage-level uniqueness, safe under concurrent workers and crashes
//! - **Failure classification and backoff**: a fixed-order rule chain,
//!   capped exponential backoff with jitter, dead-letter promotion
//! - **Batch orchestration**: single-flight cycles per stage, stale-job
//!   reclaim, WIP backpressure, near-real-time job progress records
//! - **Event-log replay**: run histories reconstructed and validated
//!   from the append-only run/step records, never by re-executing steps
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use enrichflow::prelude::*;
//!
//! let machine = StateMachine::new(StatusRegistry::builtin());
//! let stage = StageConfig::new("summarize", StatusCode(210), StatusCode(211), StatusCode(220));
//! let orchestrator = BatchOrchestrator::new(
//!     stage, step, items, runs, jobs, machine, OrchestratorConfig::default(),
//! );
//!
//! // One scheduler tick.
//! let outcome = orchestrator.run_cycle().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod admission;
pub mod classify;
pub mod errors;
pub mod idempotency;
pub mod model;
pub mod orchestrator;
pub mod replay;
pub mod status;
pub mod step;
pub mod store;
pub mod testing;
pub mod tracker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::admission::{AdmissionController, WipCapacity, WipLimits};
    pub use crate::classify::{
        classify, next_failure_count, should_dead_letter, BackoffConfig, Classification,
        ErrorKind,
    };
    pub use crate::errors::{EngineError, IdempotencyCollisionError, InvalidTransitionError};
    pub use crate::idempotency::{
        ExecuteRequest, ExecutionError, IdempotencyExecutor, StepExecution,
    };
    pub use crate::model::{
        idempotency_key, FailureRecord, ItemPatch, JobRecord, JobStatus, OverrideScope,
        PipelineRun, RunStatus, RunTrigger, StepOverride, StepRun, StepStatus, WorkItem,
    };
    pub use crate::orchestrator::{
        BatchOrchestrator, BatchOutcome, OrchestratorConfig, StageConfig,
    };
    pub use crate::replay::{
        replay_records, ReplayBatchReport, ReplayEngine, ReplayEvent, ReplayReport,
        ReplayValidation,
    };
    pub use crate::status::{
        builtin_config, RetryDef, StateMachine, StatusCode, StatusConfig, StatusDef,
        StatusRegistry, TransitionDef,
    };
    pub use crate::step::{ClassifiableError, StepError, StepFunction, StepOutcome};
    pub use crate::store::{
        InMemoryItemStore, InMemoryJobStore, InMemoryRunStore, ItemStore, JobStore, JobUpdate,
        NewStepRun, RunFilter, RunStore, StepClose, StoreError,
    };
    pub use crate::tracker::{error_signature, RunTracker};
}
