//! Concurrent execution of a batch of independent steps.
//!
//! Each worker gets its own deep copy of the state. When the batch finishes
//! the copies are folded back into one state, in declaration order:
//! bookkeeping lists are unioned, payload keys are taken only from the step
//! that declared them, and `last_modified` becomes the latest of all workers.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use folio_types::{FolioError, Result, SharedState};

use crate::retry::{RetryExecutor, StepReport};
use crate::step::StepUnit;

/// Runs batches of mutually independent steps on a bounded worker pool.
#[derive(Clone)]
pub struct ParallelBatchRunner {
    max_workers: usize,
    executor: RetryExecutor,
}

impl ParallelBatchRunner {
    pub fn new(max_workers: usize, executor: RetryExecutor) -> Self {
        Self {
            max_workers: max_workers.max(1),
            executor,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run a single unit directly on `state`, with no copy or merge.
    ///
    /// The handler still runs on its own task, so a panic is recorded as a
    /// failure of that step instead of unwinding into the caller.
    pub async fn run_one(
        &self,
        unit: &Arc<StepUnit>,
        state: SharedState,
    ) -> Result<(SharedState, StepReport)> {
        let task_unit = Arc::clone(unit);
        let executor = self.executor.clone();
        let task_state = state.clone();
        let handle = tokio::spawn(async move { executor.run(&task_unit, task_state).await });
        match handle.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                let mut state = state;
                let report = record_crash(&mut state, unit, format!("worker panicked: {join_err}"));
                Ok((state, report))
            }
        }
    }

    /// Run every unit of `batch` against its own copy of `state` and merge
    /// the results. Reports come back in batch order.
    ///
    /// Returns [`FolioError::Cancelled`] if the run was cancelled while the
    /// batch was in flight; `state` is then left as it was before the batch.
    pub async fn run_batch(
        &self,
        batch: &[Arc<StepUnit>],
        state: SharedState,
    ) -> Result<(SharedState, Vec<StepReport>)> {
        tracing::info!(
            steps = ?batch.iter().map(|u| u.name.as_str()).collect::<Vec<_>>(),
            workers = self.max_workers,
            "Running batch"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut join_set = JoinSet::new();

        for (idx, unit) in batch.iter().enumerate() {
            let unit = Arc::clone(unit);
            let executor = self.executor.clone();
            let worker_state = state.clone();
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                // The inner task isolates a panicking handler so the batch
                // still knows which step it belonged to.
                let handle = tokio::spawn(async move { executor.run(&unit, worker_state).await });
                (idx, handle.await)
            });
        }

        let mut results: Vec<Option<WorkerResult>> = (0..batch.len()).map(|_| None).collect();
        let mut cancelled = false;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, Ok(Ok(output)))) => results[idx] = Some(WorkerResult::Finished(output)),
                Ok((_, Ok(Err(FolioError::Cancelled)))) => cancelled = true,
                Ok((idx, Ok(Err(e)))) => results[idx] = Some(WorkerResult::Crashed(e.to_string())),
                Ok((idx, Err(join_err))) => {
                    results[idx] = Some(WorkerResult::Crashed(format!("worker panicked: {join_err}")))
                }
                Err(join_err) => {
                    return Err(FolioError::Other(format!("batch worker failed: {join_err}")));
                }
            }
        }

        if cancelled {
            return Err(FolioError::Cancelled);
        }

        let origin = state;
        let mut merged = origin.clone();
        let mut reports = Vec::with_capacity(batch.len());

        for (unit, result) in batch.iter().zip(results) {
            match result {
                Some(WorkerResult::Finished((worker, report))) => {
                    merge_worker(&mut merged, &origin, worker, unit);
                    reports.push(report);
                }
                Some(WorkerResult::Crashed(message)) => {
                    reports.push(record_crash(&mut merged, unit, message));
                }
                None => {
                    return Err(FolioError::Other(format!(
                        "batch worker for '{}' produced no result",
                        unit.name
                    )));
                }
            }
        }

        Ok((merged, reports))
    }
}

/// Record a worker that died without returning a state.
fn record_crash(state: &mut SharedState, unit: &StepUnit, message: String) -> StepReport {
    tracing::error!(step = %unit.name, error = %message, "Step worker crashed");
    state.push_error(&unit.name, &message);
    state.touch();
    StepReport {
        step: unit.name.clone(),
        attempts: 0,
        error: Some(message),
        duration: Default::default(),
    }
}

enum WorkerResult {
    Finished((SharedState, StepReport)),
    Crashed(String),
}

/// Fold one worker's copy back into `merged`. `origin` is the state every
/// worker started from; anything a worker appended beyond it is new.
pub fn merge_worker(
    merged: &mut SharedState,
    origin: &SharedState,
    worker: SharedState,
    unit: &StepUnit,
) {
    for step in &worker.completed_steps {
        merged.mark_completed(step);
    }
    merged
        .errors
        .extend(worker.errors.iter().skip(origin.errors.len()).cloned());
    merged
        .warnings
        .extend(worker.warnings.iter().skip(origin.warnings.len()).cloned());
    merged
        .progress_log
        .extend(worker.progress_log.iter().skip(origin.progress_log.len()).cloned());
    for (step, started) in &worker.step_start_times {
        merged.step_start_times.entry(step.clone()).or_insert(*started);
    }

    for (key, value) in worker.payload {
        if origin.payload.get(&key) == Some(&value) {
            continue;
        }
        if unit.owns_key(&key) {
            merged.payload.insert(key, value);
        } else {
            tracing::warn!(step = %unit.name, key = %key, "Discarding write to undeclared payload key");
            merged.push_warning(format!(
                "{}: wrote undeclared payload key '{}'; discarded",
                unit.name, key
            ));
        }
    }

    merged.revision_rounds = merged.revision_rounds.max(worker.revision_rounds);
    merged.last_modified = merged.last_modified.max(worker.last_modified);
    merged.current_step = unit.name.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::retry::RetryPolicy;

    fn writer(name: &str, key: &'static str, delay_ms: u64) -> Arc<StepUnit> {
        let step = name.to_string();
        Arc::new(
            StepUnit::from_fn(name, move |mut state: SharedState| {
                let step = step.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    state.set(key, format!("written by {step}"));
                    Ok(state)
                }
            })
            .owns([key])
            .with_retry(RetryPolicy::new(1, Duration::ZERO)),
        )
    }

    fn runner(workers: usize) -> ParallelBatchRunner {
        ParallelBatchRunner::new(workers, RetryExecutor::default())
    }

    #[tokio::test]
    async fn disjoint_writes_are_both_kept() {
        // "slow" finishes last, but both writes must survive either way.
        for (a_delay, b_delay) in [(30, 0), (0, 30)] {
            let batch = vec![writer("glossary", "glossary", a_delay), writer("quiz", "quiz", b_delay)];
            let (state, reports) = runner(4)
                .run_batch(&batch, SharedState::new("Rust"))
                .await
                .unwrap();

            assert_eq!(state.get_str("glossary"), "written by glossary");
            assert_eq!(state.get_str("quiz"), "written by quiz");
            assert_eq!(state.completed_steps, vec!["glossary", "quiz"]);
            assert_eq!(reports.len(), 2);
            assert!(reports.iter().all(StepReport::succeeded));
        }
    }

    #[tokio::test]
    async fn undeclared_writes_are_discarded_with_warning() {
        let rogue = Arc::new(
            StepUnit::from_fn("rogue", |mut state: SharedState| async move {
                state.set("mine", 1);
                state.set("outline", "clobbered");
                Ok(state)
            })
            .owns(["mine"]),
        );
        let mut input = SharedState::new("Rust");
        input.set("outline", "original");

        let (state, _) = runner(2)
            .run_batch(&[rogue, writer("quiz", "quiz", 0)], input)
            .await
            .unwrap();

        assert_eq!(state.get_str("outline"), "original");
        assert_eq!(state.get("mine"), Some(&serde_json::json!(1)));
        assert_eq!(state.warnings.len(), 1);
        assert!(state.warnings[0].contains("outline"));
    }

    #[tokio::test]
    async fn failures_are_merged_as_errors() {
        let failing = Arc::new(
            StepUnit::from_fn("quiz", |_state: SharedState| async move {
                Err(FolioError::Other("no questions".into()))
            })
            .with_retry(RetryPolicy::new(2, Duration::ZERO)),
        );
        let mut input = SharedState::new("Rust");
        input.errors.push("earlier: kept".into());

        let (state, reports) = runner(2)
            .run_batch(&[writer("glossary", "glossary", 0), failing], input)
            .await
            .unwrap();

        assert_eq!(state.completed_steps, vec!["glossary"]);
        assert_eq!(state.errors.len(), 2);
        assert_eq!(state.errors[0], "earlier: kept");
        assert!(state.errors[1].starts_with("quiz: "));
        assert!(!reports[1].succeeded());
        assert_eq!(reports[1].attempts, 2);
    }

    #[tokio::test]
    async fn worker_count_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let batch: Vec<Arc<StepUnit>> = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                Arc::new(StepUnit::from_fn(format!("s{i}"), move |state: SharedState| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(state)
                    }
                }))
            })
            .collect();

        let (state, _) = runner(2)
            .run_batch(&batch, SharedState::new("Rust"))
            .await
            .unwrap();

        assert_eq!(state.completed_steps.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn panicking_handler_is_recorded() {
        let panicky = Arc::new(StepUnit::from_fn("quiz", |_state: SharedState| async move {
            if true {
                panic!("handler bug");
            }
            Ok(SharedState::new("unreachable"))
        }));

        let (state, reports) = runner(2)
            .run_batch(&[writer("glossary", "glossary", 0), panicky], SharedState::new("Rust"))
            .await
            .unwrap();

        assert_eq!(state.completed_steps, vec!["glossary"]);
        assert_eq!(state.errors.len(), 1);
        assert!(state.errors[0].starts_with("quiz: worker panicked"));
        assert!(!reports[1].succeeded());
    }

    #[tokio::test]
    async fn run_one_records_panic_and_keeps_state() {
        let panicky = Arc::new(StepUnit::from_fn("quiz", |_state: SharedState| async move {
            if true {
                panic!("handler bug");
            }
            Ok(SharedState::new("unreachable"))
        }));
        let mut input = SharedState::new("Rust");
        input.set("chapters", "kept");

        let (state, report) = runner(1).run_one(&panicky, input).await.unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.attempts, 0);
        assert_eq!(state.errors.len(), 1);
        assert!(state.errors[0].starts_with("quiz: worker panicked"));
        assert_eq!(state.get_str("chapters"), "kept");
        assert!(state.completed_steps.is_empty());
    }

    #[tokio::test]
    async fn run_one_keeps_undeclared_writes() {
        let unit = Arc::new(StepUnit::from_fn("outline", |mut state: SharedState| async move {
            state.set("notes", "free-form");
            Ok(state)
        }));

        let (state, report) = runner(1).run_one(&unit, SharedState::new("Rust")).await.unwrap();

        assert!(report.succeeded());
        assert_eq!(state.get_str("notes"), "free-form");
        assert!(state.warnings.is_empty());
    }

    #[test]
    fn merge_takes_latest_timestamp() {
        let origin = SharedState::new("Rust");
        let mut merged = origin.clone();
        let unit = StepUnit::from_fn("a", |s: SharedState| async move { Ok(s) });

        let mut early = origin.clone();
        early.last_modified = Some(chrono::Utc::now() - chrono::Duration::seconds(10));
        let mut late = origin.clone();
        late.last_modified = Some(chrono::Utc::now());
        let expected = late.last_modified;

        merge_worker(&mut merged, &origin, late, &unit);
        merge_worker(&mut merged, &origin, early, &unit);
        assert_eq!(merged.last_modified, expected);
    }
}
