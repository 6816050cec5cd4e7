//! Step handler trait, the `StepUnit` wrapper, and the `Pipeline` definition.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use folio_types::{Result, SharedState};

use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// StepHandler trait
// ---------------------------------------------------------------------------

/// One unit of document work. Receives an owned copy of the state and returns
/// the mutated copy, or an error.
///
/// Handlers are called once per attempt and may run on any worker.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, state: SharedState) -> Result<SharedState>;
}

/// Adapter turning an async closure into a [`StepHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(SharedState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SharedState>> + Send + 'static,
{
    async fn execute(&self, state: SharedState) -> Result<SharedState> {
        (self.0)(state).await
    }
}

// ---------------------------------------------------------------------------
// StepUnit
// ---------------------------------------------------------------------------

/// A named, retryable unit of pipeline work with declared dependencies.
#[derive(Clone)]
pub struct StepUnit {
    pub name: String,
    pub handler: Arc<dyn StepHandler>,
    /// Steps that must be in `completed_steps` before this one may run.
    pub dependencies: Vec<String>,
    pub retry: RetryPolicy,
    /// Advisory: an attempt running longer than this is reported, not aborted.
    pub timeout: Option<Duration>,
    /// Payload keys this step writes. Only these survive a parallel merge.
    pub owns: Vec<String>,
}

impl StepUnit {
    pub fn new(name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            dependencies: Vec::new(),
            retry: RetryPolicy::default(),
            timeout: None,
            owns: Vec::new(),
        }
    }

    /// Build a unit from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(SharedState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SharedState>> + Send + 'static,
    {
        Self::new(name, Arc::new(FnHandler(f)))
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn owns<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.owns = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn owns_key(&self, key: &str) -> bool {
        self.owns.iter().any(|k| k == key)
    }
}

impl fmt::Debug for StepUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepUnit")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("owns", &self.owns)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// An ordered list of step units. Declaration order is the tie-break for
/// scheduling. Nothing is validated here; the scheduler rejects bad
/// definitions when a run starts.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    units: Vec<Arc<StepUnit>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, units: Vec<StepUnit>) -> Self {
        Self {
            name: name.into(),
            units: units.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn units(&self) -> &[Arc<StepUnit>] {
        &self.units
    }

    pub fn unit(&self, name: &str) -> Option<&Arc<StepUnit>> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_handler_mutates_state() {
        let unit = StepUnit::from_fn("outline", |mut state: SharedState| async move {
            state.set("outline", "1. Basics");
            Ok(state)
        });
        let out = unit
            .handler
            .execute(SharedState::new("Rust"))
            .await
            .unwrap();
        assert_eq!(out.get_str("outline"), "1. Basics");
    }

    #[test]
    fn builder_sets_fields() {
        let unit = StepUnit::from_fn("writer", |s: SharedState| async move { Ok(s) })
            .depends_on(["outline"])
            .owns(["draft"])
            .with_timeout(Duration::from_secs(30))
            .with_retry(RetryPolicy::new(5, Duration::from_millis(10)));

        assert_eq!(unit.dependencies, vec!["outline"]);
        assert!(unit.owns_key("draft"));
        assert!(!unit.owns_key("outline"));
        assert_eq!(unit.timeout, Some(Duration::from_secs(30)));
        assert_eq!(unit.retry.max_retries, 5);
    }

    #[test]
    fn pipeline_lookup_by_name() {
        let pipeline = Pipeline::new(
            "book",
            vec![
                StepUnit::from_fn("a", |s: SharedState| async move { Ok(s) }),
                StepUnit::from_fn("b", |s: SharedState| async move { Ok(s) }),
            ],
        );
        assert_eq!(pipeline.len(), 2);
        assert!(pipeline.unit("b").is_some());
        assert!(pipeline.unit("c").is_none());
        assert_eq!(pipeline.units()[0].name, "a");
    }

    #[test]
    fn debug_omits_handler() {
        let unit = StepUnit::from_fn("a", |s: SharedState| async move { Ok(s) });
        let rendered = format!("{unit:?}");
        assert!(rendered.contains("\"a\""));
        assert!(!rendered.contains("handler"));
    }
}
