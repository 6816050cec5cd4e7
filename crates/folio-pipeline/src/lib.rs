//! Pipeline execution engine for long-form document generation.
//!
//! This crate implements the Folio pipeline runner: dependency scheduling,
//! retry with backoff, bounded parallel batches with copy-then-merge state,
//! checkpoint/resume, the review quality gate, and per-document progress
//! events, plus the built-in book steps.

pub mod active;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod events;
pub mod parallel;
pub mod quality;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod step;
pub mod steps;

pub use active::{ActiveJobGuard, ActiveJobs};
pub use checkpoint::CheckpointStore;
pub use config::{EngineConfig, FailurePolicy};
pub use engine::{PipelineEngine, PipelineResult};
pub use events::{default_macro_steps, EventBus, MacroStep, PipelineEvent, StepChange, StepListener};
pub use parallel::{merge_worker, ParallelBatchRunner};
pub use quality::{quality_score, GateDecision, QualityGate, SCORE_KEYS};
pub use registry::{default_pipeline, default_registry, select, StepDescriptor, StepRegistry};
pub use retry::{RetryExecutor, RetryPolicy, StepReport};
pub use scheduler::ExecutionPlan;
pub use step::{FnHandler, Pipeline, StepHandler, StepUnit};
pub use steps::{
    parse_scores, DryRunGenerator, FinalStep, GenerativeStep, QualityCheckStep, ReviewStep,
    ReviseStep,
};
