//! Retry logic with exponential backoff for step execution.
//!
//! [`RetryExecutor::run`] invokes a step handler up to `max_retries` times.
//! A step that fails every attempt is recorded in `SharedState::errors` and
//! the run carries on: a missing section degrades the document, it does not
//! abort the job.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use folio_types::{FolioError, Result, SharedState};

use crate::events::{EventBus, PipelineEvent};
use crate::step::StepUnit;

/// How often a step is attempted and how long to wait in between.
///
/// The wait before retry `i` (0-indexed) is `base_delay * 2^i`, computed on
/// the `Duration` itself so sub-millisecond bases keep their precision.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Values below 1 are
    /// treated as 1.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay before the retry that follows failed attempt `attempt`
    /// (0-indexed). Saturates at `Duration::MAX`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.base_delay;
        for _ in 0..attempt {
            match delay.checked_mul(2) {
                Some(doubled) => delay = doubled,
                None => return Duration::MAX,
            }
        }
        delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

/// Summary of one step's execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step: String,
    pub attempts: u32,
    /// The last error, when every attempt failed.
    pub error: Option<String>,
    pub duration: Duration,
}

impl StepReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs one step with retries and backoff.
///
/// The only error it returns is [`FolioError::Cancelled`]; handler failures
/// are folded into the returned state.
#[derive(Clone, Default)]
pub struct RetryExecutor {
    events: Option<EventBus>,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            events: None,
            cancel,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    pub async fn run(
        &self,
        step: &StepUnit,
        mut state: SharedState,
    ) -> Result<(SharedState, StepReport)> {
        let started = Instant::now();
        state.record_start(&step.name);
        state.current_step = step.name.clone();
        self.emit(PipelineEvent::StepStarted {
            document_id: state.document_id.clone(),
            step: step.name.clone(),
        });

        let max_attempts = step.retry.attempts();
        let mut attempts = 0;
        let mut last_err = None;

        while attempts < max_attempts {
            if self.cancel.is_cancelled() {
                return Err(FolioError::Cancelled);
            }
            let attempt = attempts;
            attempts += 1;

            let attempt_started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FolioError::Cancelled),
                r = step.handler.execute(state.clone()) => r,
            };

            match result {
                Ok(mut next) => {
                    let elapsed = attempt_started.elapsed();
                    if let Some(limit) = step.timeout {
                        if elapsed > limit {
                            tracing::warn!(
                                step = %step.name,
                                elapsed_ms = %elapsed.as_millis(),
                                timeout_ms = %limit.as_millis(),
                                "Step exceeded its timeout"
                            );
                            next.push_warning(format!(
                                "{}: attempt took {}ms, over its {}ms timeout",
                                step.name,
                                elapsed.as_millis(),
                                limit.as_millis()
                            ));
                        }
                    }
                    next.mark_completed(&step.name);
                    next.progress_log.push(step.name.clone());
                    next.current_step = step.name.clone();
                    next.touch();
                    tracing::info!(step = %step.name, attempts, "Step completed");
                    let report = StepReport {
                        step: step.name.clone(),
                        attempts,
                        error: None,
                        duration: started.elapsed(),
                    };
                    self.emit(PipelineEvent::StepCompleted {
                        document_id: next.document_id.clone(),
                        step: step.name.clone(),
                        attempts,
                        duration_ms: report.duration.as_millis() as u64,
                    });
                    return Ok((next, report));
                }
                Err(FolioError::Cancelled) => return Err(FolioError::Cancelled),
                Err(e) => {
                    if attempts < max_attempts {
                        let delay = step.retry.delay_for_attempt(attempt);
                        tracing::warn!(
                            step = %step.name,
                            attempt,
                            delay_ms = %delay.as_millis(),
                            error = %e,
                            "Step failed, retrying"
                        );
                        self.emit(PipelineEvent::StepRetrying {
                            document_id: state.document_id.clone(),
                            step: step.name.clone(),
                            attempt: attempts,
                            delay_ms: delay.as_millis() as u64,
                            error: e.to_string(),
                        });
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return Err(FolioError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        tracing::warn!(step = %step.name, attempt, error = %e, "Step failed");
                    }
                    last_err = Some(e);
                }
            }
        }

        let message = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts were made".to_string());
        tracing::error!(step = %step.name, attempts, error = %message, "Retries exhausted");
        state.push_error(&step.name, &message);
        state.touch();
        self.emit(PipelineEvent::StepFailed {
            document_id: state.document_id.clone(),
            step: step.name.clone(),
            attempts,
            error: message.clone(),
        });
        let report = StepReport {
            step: step.name.clone(),
            attempts,
            error: Some(message),
            duration: started.elapsed(),
        };
        Ok((state, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn flaky_step(failures: usize, calls: Arc<AtomicUsize>) -> StepUnit {
        StepUnit::from_fn("writer", move |mut state: SharedState| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    return Err(FolioError::StepFailed {
                        step: "writer".into(),
                        message: format!("attempt {n} failed"),
                    });
                }
                state.set("draft", "text");
                Ok(state)
            }
        })
        .owns(["draft"])
    }

    // 1. Success on first try marks the step completed
    #[tokio::test]
    async fn success_on_first_try() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = flaky_step(0, calls.clone()).with_retry(RetryPolicy::new(3, Duration::ZERO));

        let (state, report) = RetryExecutor::default()
            .run(&step, SharedState::new("Rust"))
            .await
            .unwrap();

        assert!(report.succeeded());
        assert_eq!(report.attempts, 1);
        assert_eq!(state.completed_steps, vec!["writer"]);
        assert_eq!(state.progress_log, vec!["writer"]);
        assert_eq!(state.current_step, "writer");
        assert_eq!(state.get_str("draft"), "text");
        assert!(state.last_modified.is_some());
        assert!(state.step_start_times.contains_key("writer"));
    }

    // 2. Two failures then success within the bound
    #[tokio::test]
    async fn recovers_after_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = flaky_step(2, calls.clone()).with_retry(RetryPolicy::new(3, Duration::ZERO));

        let (state, report) = RetryExecutor::default()
            .run(&step, SharedState::new("Rust"))
            .await
            .unwrap();

        assert!(report.succeeded());
        assert_eq!(report.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(state.errors.is_empty());
        assert!(state.is_completed("writer"));
    }

    // 3. Exhausted retries leave exactly one error and no completion
    #[tokio::test]
    async fn exhausted_retries_record_one_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let step = flaky_step(usize::MAX, calls.clone())
            .with_retry(RetryPolicy::new(3, Duration::ZERO));

        let mut input = SharedState::new("Rust");
        input.set("outline", "kept");
        let (state, report) = RetryExecutor::default().run(&step, input).await.unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.errors.len(), 1);
        assert!(state.errors[0].starts_with("writer: "));
        assert!(state.completed_steps.is_empty());
        assert!(state.progress_log.is_empty());
        assert_eq!(state.get_str("outline"), "kept");
        assert_eq!(state.get("draft"), None);
    }

    // 4. Backoff sleeps base * 2^attempt between attempts
    #[tokio::test(start_paused = true)]
    async fn backoff_between_attempts_doubles() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let s = stamps.clone();
        let step = StepUnit::from_fn("writer", move |_state: SharedState| {
            let s = s.clone();
            async move {
                s.lock().unwrap().push(Instant::now());
                Err(FolioError::Other("down".into()))
            }
        })
        .with_retry(RetryPolicy::new(3, Duration::from_millis(100)));

        RetryExecutor::default()
            .run(&step, SharedState::new("Rust"))
            .await
            .unwrap();

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 3);
        assert_eq!(stamps[1] - stamps[0], Duration::from_millis(100));
        assert_eq!(stamps[2] - stamps[1], Duration::from_millis(200));
    }

    // 5. Every handler error uses the full attempt budget
    #[tokio::test]
    async fn invalid_input_error_is_still_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let step = StepUnit::from_fn("writer", move |_state: SharedState| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(FolioError::InvalidInput("empty outline".into()))
            }
        })
        .with_retry(RetryPolicy::new(3, Duration::ZERO));

        let (state, report) = RetryExecutor::default()
            .run(&step, SharedState::new("Rust"))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.attempts, 3);
        assert_eq!(state.errors.len(), 1);
        assert!(state.errors[0].contains("empty outline"));
    }

    // 6. Start time is recorded once and survives retries
    #[tokio::test]
    async fn start_time_is_idempotent() {
        let mut input = SharedState::new("Rust");
        input.record_start("writer");
        let first = input.step_start_times["writer"];

        let calls = Arc::new(AtomicUsize::new(0));
        let step = flaky_step(1, calls).with_retry(RetryPolicy::new(2, Duration::ZERO));
        let (state, _) = RetryExecutor::default().run(&step, input).await.unwrap();

        assert_eq!(state.step_start_times["writer"], first);
    }

    // 7. Cancellation interrupts a backoff sleep
    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_backoff() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let step = flaky_step(usize::MAX, calls.clone())
            .with_retry(RetryPolicy::new(5, Duration::from_secs(60)));

        let executor = RetryExecutor::new(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let started = Instant::now();
        let result = executor.run(&step, SharedState::new("Rust")).await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(FolioError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    // 8. Slow attempts produce an advisory warning but still complete
    #[tokio::test(start_paused = true)]
    async fn timeout_is_advisory() {
        let step = StepUnit::from_fn("writer", |state: SharedState| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(state)
        })
        .with_timeout(Duration::from_secs(1));

        let (state, report) = RetryExecutor::default()
            .run(&step, SharedState::new("Rust"))
            .await
            .unwrap();

        assert!(report.succeeded());
        assert!(state.is_completed("writer"));
        assert_eq!(state.warnings.len(), 1);
        assert!(state.warnings[0].contains("timeout"));
    }

    #[test]
    fn default_backoff_starts_at_two_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
    }

    #[test]
    fn sub_millisecond_base_keeps_precision() {
        let policy = RetryPolicy::new(3, Duration::from_micros(500));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_micros(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1));

        let policy = RetryPolicy::new(3, Duration::from_micros(1500));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_micros(1500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_micros(3000));
    }

    // Sub-millisecond backoff is actually slept, not rounded away
    #[tokio::test(start_paused = true)]
    async fn sub_millisecond_backoff_is_slept() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let s = stamps.clone();
        let step = StepUnit::from_fn("writer", move |_state: SharedState| {
            let s = s.clone();
            async move {
                s.lock().unwrap().push(Instant::now());
                Err(FolioError::Other("down".into()))
            }
        })
        .with_retry(RetryPolicy::new(2, Duration::from_micros(500)));

        RetryExecutor::default()
            .run(&step, SharedState::new("Rust"))
            .await
            .unwrap();

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 2);
        assert!(stamps[1] - stamps[0] >= Duration::from_micros(500));
    }

    #[test]
    fn huge_attempt_saturates() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(200), Duration::MAX);
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(16));
    }

    #[test]
    fn zero_retries_still_attempts_once() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts(), 1);
        assert_eq!(RetryPolicy::default().attempts(), 3);
    }
}
