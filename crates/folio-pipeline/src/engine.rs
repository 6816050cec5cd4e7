//! Pipeline execution engine: the top-level run loop.
//!
//! A run goes through five phases: claim the document, plan, restore or
//! create the state, execute batch by batch with a checkpoint after each,
//! finalize.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use folio_types::{FolioError, Result, SharedState};

use crate::active::ActiveJobs;
use crate::checkpoint::CheckpointStore;
use crate::config::{EngineConfig, FailurePolicy};
use crate::events::{EventBus, PipelineEvent};
use crate::parallel::ParallelBatchRunner;
use crate::quality::{GateDecision, QualityGate};
use crate::registry::{default_pipeline, select, StepDescriptor, StepRegistry};
use crate::retry::{RetryExecutor, StepReport};
use crate::scheduler::{self, ExecutionPlan};
use crate::step::{Pipeline, StepUnit};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Drives one pipeline definition. A single engine may run many documents,
/// one at a time per output directory: a run claims `output_dir` for as long
/// as it holds the checkpoint there.
pub struct PipelineEngine {
    pipeline: Pipeline,
    config: EngineConfig,
    events: EventBus,
    active: Arc<ActiveJobs>,
    gate: Option<QualityGate>,
    cancel: CancellationToken,
}

/// The outcome of a finished run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: String,
    pub state: SharedState,
    /// Steps executed by this invocation, in execution order. Review and
    /// revise appear once per gate round.
    pub executed: Vec<String>,
    /// Steps not executed: already complete, or blocked by a failed dependency.
    pub skipped: Vec<String>,
    /// Steps whose retries were exhausted in this invocation.
    pub failed: Vec<String>,
    pub duration: Duration,
    pub resumed: bool,
}

impl PipelineResult {
    pub fn error_count(&self) -> usize {
        self.state.errors.len()
    }

    pub fn is_clean(&self) -> bool {
        self.state.errors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// PipelineEngine
// ---------------------------------------------------------------------------

impl PipelineEngine {
    pub fn new(pipeline: Pipeline, config: EngineConfig) -> Self {
        Self {
            pipeline,
            config,
            events: EventBus::default(),
            active: ActiveJobs::global(),
            gate: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Build the book pipeline from `registry`, honoring `agent_sequence`.
    /// A quality gate is attached when the selection contains `reviewer` and
    /// a `revise` step is registered.
    pub fn from_registry(registry: &StepRegistry, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let descriptors = match &config.agent_sequence {
            Some(sequence) => select(&default_pipeline(), sequence),
            None => default_pipeline(),
        };
        let units = registry.build(&descriptors, &config)?;

        let gate = if descriptors.iter().any(|d| d.name == "reviewer") && registry.has("revise") {
            let revise = registry.unit(&StepDescriptor::new("revise"), &config)?;
            Some(
                QualityGate::new("reviewer", revise)
                    .with_threshold(config.quality_threshold)
                    .with_max_revisions(config.max_revisions),
            )
        } else {
            None
        };

        let mut engine = Self::new(Pipeline::new("book", units), config);
        engine.gate = gate;
        Ok(engine)
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Use a private active-job set instead of the process-wide one.
    pub fn with_active_jobs(mut self, active: Arc<ActiveJobs>) -> Self {
        self.active = active;
        self
    }

    pub fn with_quality_gate(mut self, gate: QualityGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts every run of this engine when cancelled. This is
    /// permanent: runs started after it fires return
    /// [`FolioError::Cancelled`] at once. Use [`PipelineEngine::run_token`]
    /// to stop a single run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A fresh token for one run, for [`PipelineEngine::run_with_cancel`].
    /// Cancelling it stops only that run; the engine token still reaches it.
    pub fn run_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn quality_gate(&self) -> Option<&QualityGate> {
        self.gate.as_ref()
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(&self.config.output_dir)
    }

    /// The execution plan a run would follow.
    pub fn plan(&self) -> Result<ExecutionPlan> {
        scheduler::plan(&self.pipeline, self.config.parallel_enabled)
    }

    /// Run the pipeline for `document_id`.
    ///
    /// Step failures never surface here; they are recorded in the returned
    /// state's `errors`. Only a bad pipeline definition, a conflicting run,
    /// invalid input or cancellation return an error.
    pub async fn run(&self, document_id: &str, resume: bool) -> Result<PipelineResult> {
        self.run_with_cancel(document_id, resume, self.run_token()).await
    }

    /// [`PipelineEngine::run`] stopped by `cancel` instead of a token of its own.
    pub async fn run_with_cancel(
        &self,
        document_id: &str,
        resume: bool,
        cancel: CancellationToken,
    ) -> Result<PipelineResult> {
        let document_id = document_id.trim();
        if document_id.is_empty() {
            return Err(FolioError::InvalidInput("document id must not be empty".into()));
        }

        // Phase 1: claim the document and its output directory. The guards
        // release the claim and the phase tracking on every exit.
        let _guard = self.active.try_acquire_in(document_id, &self.config.output_dir)?;
        let _progress = ProgressReset {
            events: &self.events,
            document_id,
        };
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        // Phase 2: plan. Structural errors abort before any handler runs.
        let plan = self.plan()?;

        // Phase 3: initial state.
        let store = self.checkpoint_store();
        let (mut state, resumed) = self.initial_state(&store, document_id, resume).await;
        state.generation_started.get_or_insert_with(Utc::now);

        tracing::info!(
            document = %document_id,
            run_id = %run_id,
            resumed,
            steps = plan.step_count(),
            parallel = self.config.parallel_enabled,
            "Pipeline started"
        );
        self.events.emit(PipelineEvent::RunStarted {
            document_id: document_id.to_string(),
            run_id: run_id.clone(),
            resumed,
            step_count: plan.step_count(),
        });

        // Phase 4: execute.
        let executor = RetryExecutor::new(cancel.clone()).with_events(self.events.clone());
        let runner = ParallelBatchRunner::new(self.config.max_workers, executor);
        let mut executed = Vec::new();
        let mut skipped = Vec::new();
        let mut failed: Vec<String> = Vec::new();

        for batch in plan.into_batches() {
            if cancel.is_cancelled() {
                return self.abort(&store, &state).await;
            }

            let batch_steps: Vec<String> = batch.iter().map(|u| u.name.clone()).collect();
            let mut runnable: Vec<Arc<StepUnit>> = Vec::with_capacity(batch.len());
            for unit in batch {
                if state.is_completed(&unit.name) {
                    tracing::debug!(step = %unit.name, "Skipping completed step");
                    self.skip(&mut skipped, document_id, &unit.name, "already completed");
                    continue;
                }
                let missing: Vec<String> = unit
                    .dependencies
                    .iter()
                    .filter(|d| !state.is_completed(d.as_str()))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    runnable.push(unit);
                    continue;
                }
                let missing = missing.join(", ");
                match self.config.failure_policy {
                    FailurePolicy::Continue => {
                        tracing::warn!(step = %unit.name, missing = %missing, "Running step without failed dependencies");
                        state.push_warning(format!(
                            "{}: ran without failed dependencies: {missing}",
                            unit.name
                        ));
                        runnable.push(unit);
                    }
                    FailurePolicy::SkipDependents => {
                        tracing::warn!(step = %unit.name, missing = %missing, "Skipping step with failed dependencies");
                        state.push_warning(format!(
                            "{}: skipped, dependencies did not complete: {missing}",
                            unit.name
                        ));
                        self.skip(&mut skipped, document_id, &unit.name, "dependency failed");
                    }
                }
            }
            if !runnable.is_empty() {
                let outcome = if let [unit] = runnable.as_slice() {
                    runner
                        .run_one(unit, state.clone())
                        .await
                        .map(|(next, report)| (next, vec![report]))
                } else {
                    self.events.emit(PipelineEvent::BatchStarted {
                        document_id: document_id.to_string(),
                        steps: runnable.iter().map(|u| u.name.clone()).collect(),
                    });
                    runner.run_batch(&runnable, state.clone()).await
                };
                let reports = match outcome {
                    Ok((next, reports)) => {
                        state = next;
                        reports
                    }
                    Err(FolioError::Cancelled) => return self.abort(&store, &state).await,
                    Err(e) => {
                        self.save_checkpoint(&store, &state).await;
                        return Err(e);
                    }
                };

                self.record_reports(document_id, &reports, &mut executed, &mut failed);
                self.save_checkpoint(&store, &state).await;
            }

            // Also reached when the review step was restored from a checkpoint,
            // so a gate interrupted mid-revision picks up where it stopped.
            if let Some(gate) = &self.gate {
                if self.gate_pending(gate, &batch_steps, &state) {
                    let gated = self
                        .apply_gate(gate, state.clone(), &runner, &store, &mut executed, &mut failed)
                        .await;
                    match gated {
                        Ok(next) => state = next,
                        Err(FolioError::Cancelled) => return self.abort(&store, &state).await,
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        // Phase 5: finalize.
        state.generation_completed = Some(Utc::now());
        state.touch();
        if self.config.keep_checkpoint_on_error && !state.errors.is_empty() {
            tracing::info!(
                document = %document_id,
                errors = state.errors.len(),
                "Keeping checkpoint so failed steps can be resumed"
            );
            self.save_checkpoint(&store, &state).await;
        } else if let Err(e) = store.clear().await {
            tracing::warn!(document = %document_id, error = %e, "Failed to clear checkpoint");
        }

        let duration = started.elapsed();
        tracing::info!(
            document = %document_id,
            completed = state.completed_steps.len(),
            errors = state.errors.len(),
            duration_ms = %duration.as_millis(),
            "Pipeline finished"
        );
        self.events.emit(PipelineEvent::RunCompleted {
            document_id: document_id.to_string(),
            run_id: run_id.clone(),
            completed_steps: state.completed_steps.clone(),
            error_count: state.errors.len(),
            duration_ms: duration.as_millis() as u64,
        });

        Ok(PipelineResult {
            run_id,
            state,
            executed,
            skipped,
            failed,
            duration,
            resumed,
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn initial_state(
        &self,
        store: &CheckpointStore,
        document_id: &str,
        resume: bool,
    ) -> (SharedState, bool) {
        if !resume {
            return (SharedState::new(document_id), false);
        }
        match store.load().await {
            Ok(Some(state)) if state.document_id == document_id => {
                tracing::info!(
                    document = %document_id,
                    completed = ?state.completed_steps,
                    "Resuming from checkpoint"
                );
                (state, true)
            }
            Ok(Some(state)) => {
                tracing::warn!(
                    document = %document_id,
                    checkpoint_document = %state.document_id,
                    "Checkpoint belongs to another document; starting fresh"
                );
                (SharedState::new(document_id), false)
            }
            Ok(None) => {
                tracing::info!(document = %document_id, "No checkpoint found; starting fresh");
                (SharedState::new(document_id), false)
            }
            Err(e) => {
                tracing::warn!(document = %document_id, error = %e, "Failed to load checkpoint; starting fresh");
                (SharedState::new(document_id), false)
            }
        }
    }

    fn skip(&self, skipped: &mut Vec<String>, document_id: &str, step: &str, reason: &str) {
        skipped.push(step.to_string());
        self.events.emit(PipelineEvent::StepSkipped {
            document_id: document_id.to_string(),
            step: step.to_string(),
            reason: reason.to_string(),
        });
    }

    fn record_reports(
        &self,
        document_id: &str,
        reports: &[StepReport],
        executed: &mut Vec<String>,
        failed: &mut Vec<String>,
    ) {
        for report in reports {
            executed.push(report.step.clone());
            if !report.succeeded() && !failed.contains(&report.step) {
                failed.push(report.step.clone());
            }
            self.events.dispatch(document_id, &report.step);
        }
    }

    /// Best effort: a failed save is logged and the run goes on.
    async fn save_checkpoint(&self, store: &CheckpointStore, state: &SharedState) {
        match store.save(state).await {
            Ok(_) => self.events.emit(PipelineEvent::CheckpointSaved {
                document_id: state.document_id.clone(),
                step: state.current_step.clone(),
            }),
            Err(e) => tracing::warn!(
                document = %state.document_id,
                step = %state.current_step,
                error = %e,
                "Checkpoint save failed; continuing without durable recovery for this step"
            ),
        }
    }

    async fn abort(&self, store: &CheckpointStore, state: &SharedState) -> Result<PipelineResult> {
        tracing::warn!(document = %state.document_id, "Pipeline cancelled");
        self.save_checkpoint(store, state).await;
        Err(FolioError::Cancelled)
    }

    /// The gate runs when the review step is complete and none of its
    /// dependents has completed.
    fn gate_pending(&self, gate: &QualityGate, batch: &[String], state: &SharedState) -> bool {
        if !batch.contains(&gate.review_step) || !state.is_completed(&gate.review_step) {
            return false;
        }
        !self
            .pipeline
            .units()
            .iter()
            .filter(|u| u.dependencies.contains(&gate.review_step))
            .any(|u| state.is_completed(&u.name))
    }

    async fn apply_gate(
        &self,
        gate: &QualityGate,
        mut state: SharedState,
        runner: &ParallelBatchRunner,
        store: &CheckpointStore,
        executed: &mut Vec<String>,
        failed: &mut Vec<String>,
    ) -> Result<SharedState> {
        let Some(review) = self.pipeline.unit(&gate.review_step).cloned() else {
            return Ok(state);
        };
        let document_id = state.document_id.clone();

        let mut needs_review = review_outstanding(gate, &state);
        if needs_review {
            tracing::info!(
                document = %document_id,
                round = state.revision_rounds,
                "Revised content has not been reviewed yet; reviewing before the gate"
            );
        }

        loop {
            if needs_review {
                let (next, ok) = self
                    .gate_step(runner, &review, state, store, executed, failed)
                    .await?;
                state = next;
                if !ok {
                    return Ok(state);
                }
            }

            let decision = gate.decide(&state);
            self.events.emit(PipelineEvent::QualityGate {
                document_id: document_id.clone(),
                score: decision.score(),
                decision: decision.label().to_string(),
            });

            let round = match decision {
                GateDecision::Pass { score } => {
                    tracing::info!(document = %document_id, score = ?score, "Quality gate passed");
                    return Ok(state);
                }
                GateDecision::Exhausted { score } => {
                    tracing::warn!(document = %document_id, score, rounds = state.revision_rounds, "Quality gate still failing; no revisions left");
                    let warning = format!(
                        "quality: score {score:.2} below threshold {:.2} after {} revision rounds",
                        gate.threshold, state.revision_rounds
                    );
                    if !state.warnings.contains(&warning) {
                        state.push_warning(warning);
                    }
                    return Ok(state);
                }
                GateDecision::Revise { score, round } => {
                    tracing::info!(document = %document_id, score, round, "Quality below threshold; revising");
                    round
                }
            };

            state.revision_rounds = round;
            let (next, ok) = self
                .gate_step(runner, &gate.revise, state, store, executed, failed)
                .await?;
            state = next;
            if !ok {
                return Ok(state);
            }
            needs_review = true;
        }
    }

    /// Run one revise or review step of the gate and checkpoint the result.
    /// Returns `false` when the step failed and the gate should be left.
    async fn gate_step(
        &self,
        runner: &ParallelBatchRunner,
        unit: &Arc<StepUnit>,
        state: SharedState,
        store: &CheckpointStore,
        executed: &mut Vec<String>,
        failed: &mut Vec<String>,
    ) -> Result<(SharedState, bool)> {
        let (state, report) = runner.run_one(unit, state).await?;
        self.record_reports(&state.document_id, std::slice::from_ref(&report), executed, failed);
        self.save_checkpoint(store, &state).await;
        if !report.succeeded() {
            tracing::warn!(document = %state.document_id, step = %report.step, "Revision round failed; leaving the gate");
        }
        Ok((state, report.succeeded()))
    }
}

/// True when the revise step ran after the last review, i.e. the current
/// scores describe content that has since been rewritten.
fn review_outstanding(gate: &QualityGate, state: &SharedState) -> bool {
    let last = |step: &str| state.progress_log.iter().rposition(|s| s == step);
    match (last(&gate.revise.name), last(&gate.review_step)) {
        (Some(revised), Some(reviewed)) => revised > reviewed,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Drops a document's phase tracking when its run ends.
struct ProgressReset<'a> {
    events: &'a EventBus,
    document_id: &'a str,
}

impl Drop for ProgressReset<'_> {
    fn drop(&mut self) {
        self.events.forget(self.document_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
