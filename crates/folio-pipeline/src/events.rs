//! Pipeline event system for observability.
//!
//! Two channels are offered:
//! - typed [`PipelineEvent`]s over a [`tokio::sync::broadcast`] channel, for
//!   loggers and metrics collectors;
//! - coarse "macro step" progress, tracked per document, with synchronous
//!   `on_step_change` callbacks for progress displays.
//!
//! Progress is keyed by document id so concurrent jobs never move each
//! other's current phase.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Events emitted during a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    RunStarted {
        document_id: String,
        run_id: String,
        resumed: bool,
        step_count: usize,
    },
    RunCompleted {
        document_id: String,
        run_id: String,
        completed_steps: Vec<String>,
        error_count: usize,
        duration_ms: u64,
    },
    BatchStarted {
        document_id: String,
        steps: Vec<String>,
    },
    StepStarted {
        document_id: String,
        step: String,
    },
    StepCompleted {
        document_id: String,
        step: String,
        attempts: u32,
        duration_ms: u64,
    },
    StepRetrying {
        document_id: String,
        step: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepFailed {
        document_id: String,
        step: String,
        attempts: u32,
        error: String,
    },
    StepSkipped {
        document_id: String,
        step: String,
        reason: String,
    },
    CheckpointSaved {
        document_id: String,
        step: String,
    },
    QualityGate {
        document_id: String,
        score: Option<f64>,
        decision: String,
    },
}

/// A coarse, externally visible phase of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroStep {
    pub name: String,
    /// Step names that put the tracker into this phase.
    #[serde(default)]
    pub members: Vec<String>,
}

impl MacroStep {
    pub fn new<I, S>(name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, event_name: &str) -> bool {
        self.name == event_name || self.members.iter().any(|m| m == event_name)
    }
}

/// Phases used for the built-in book pipeline.
pub fn default_macro_steps() -> Vec<MacroStep> {
    vec![
        MacroStep::new("Planning", ["outline"]),
        MacroStep::new("Drafting", ["writer", "chapter"]),
        MacroStep::new("Reviewing", ["reviewer", "revise", "proofreader", "quality"]),
        MacroStep::new("Enriching", ["enhancer", "glossary", "quiz"]),
        MacroStep::new("Compiling", ["final"]),
    ]
}

/// Notification delivered to step-change listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepChange {
    pub document_id: String,
    /// The macro step that is now current.
    pub macro_step: String,
    pub index: usize,
    /// The event name that caused the change.
    pub trigger: String,
}

pub type StepListener = Arc<dyn Fn(&StepChange) + Send + Sync>;

#[derive(Default)]
struct Tracker {
    current: usize,
    listeners: Vec<StepListener>,
}

struct BusInner {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
    macro_steps: Vec<MacroStep>,
    trackers: Mutex<HashMap<String, Tracker>>,
}

/// Event bus shared by every engine in the process. Cloning yields another
/// handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the given broadcast capacity and phase list.
    pub fn new(capacity: usize, macro_steps: Vec<MacroStep>) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                sender,
                macro_steps,
                trackers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.inner.sender.send(event);
    }

    /// Subscribe to typed events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.inner.sender.subscribe()
    }

    pub fn macro_steps(&self) -> &[MacroStep] {
        &self.inner.macro_steps
    }

    fn trackers(&self) -> MutexGuard<'_, HashMap<String, Tracker>> {
        self.inner
            .trackers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a callback invoked whenever the phase of `document_id` changes.
    pub fn on_step_change<F>(&self, document_id: &str, listener: F)
    where
        F: Fn(&StepChange) + Send + Sync + 'static,
    {
        self.trackers()
            .entry(document_id.to_string())
            .or_default()
            .listeners
            .push(Arc::new(listener));
    }

    /// Move `document_id` to the phase matching `event_name` and notify its
    /// listeners in registration order. Returns `false` when no phase matches.
    pub fn dispatch(&self, document_id: &str, event_name: &str) -> bool {
        let Some(index) = self
            .inner
            .macro_steps
            .iter()
            .position(|m| m.matches(event_name))
        else {
            return false;
        };
        let listeners = {
            let mut trackers = self.trackers();
            let tracker = trackers.entry(document_id.to_string()).or_default();
            tracker.current = index;
            tracker.listeners.clone()
        };
        self.notify(document_id, index, event_name, &listeners);
        true
    }

    /// Move `document_id` to the next phase, if there is one.
    pub fn advance(&self, document_id: &str) -> Option<String> {
        let (index, listeners) = {
            let mut trackers = self.trackers();
            let tracker = trackers.entry(document_id.to_string()).or_default();
            if tracker.current + 1 >= self.inner.macro_steps.len() {
                return None;
            }
            tracker.current += 1;
            (tracker.current, tracker.listeners.clone())
        };
        let name = self.inner.macro_steps[index].name.clone();
        self.notify(document_id, index, &name, &listeners);
        Some(name)
    }

    /// The current phase of `document_id`. Documents never dispatched are in
    /// the first phase.
    pub fn current(&self, document_id: &str) -> Option<String> {
        let index = self
            .trackers()
            .get(document_id)
            .map(|t| t.current)
            .unwrap_or(0);
        self.inner.macro_steps.get(index).map(|m| m.name.clone())
    }

    /// Drop the progress and listeners kept for `document_id`.
    pub fn forget(&self, document_id: &str) {
        self.trackers().remove(document_id);
    }

    fn notify(&self, document_id: &str, index: usize, trigger: &str, listeners: &[StepListener]) {
        let change = StepChange {
            document_id: document_id.to_string(),
            macro_step: self.inner.macro_steps[index].name.clone(),
            index,
            trigger: trigger.to_string(),
        };
        tracing::debug!(document = %document_id, phase = %change.macro_step, "Phase changed");
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&change))).is_err() {
                tracing::warn!(
                    document = %document_id,
                    phase = %change.macro_step,
                    "Step listener panicked; continuing with the next listener"
                );
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256, default_macro_steps())
    }
}
