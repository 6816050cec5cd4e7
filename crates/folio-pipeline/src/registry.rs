//! Static step registry and pipeline descriptors.
//!
//! Steps are looked up by name in a map populated once at startup. A
//! descriptor naming an unregistered step fails with
//! [`FolioError::UnknownStep`] before anything runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use folio_types::{FolioError, Generator, Result};

use crate::config::{retry_delay_from_secs, EngineConfig};
use crate::retry::RetryPolicy;
use crate::step::{StepHandler, StepUnit};
use crate::steps::{FinalStep, GenerativeStep, QualityCheckStep, ReviewStep, ReviseStep};

/// One entry of a pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Overrides the engine-wide retry bound.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_retry_delay_secs: Option<f64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Overrides the payload keys the registered step declares.
    #[serde(default)]
    pub owns: Vec<String>,
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            max_retries: None,
            base_retry_delay_secs: None,
            timeout_secs: None,
            owns: Vec::new(),
        }
    }

    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    fn retry_policy(&self, config: &EngineConfig) -> Result<RetryPolicy> {
        let base = match self.base_retry_delay_secs {
            Some(secs) => retry_delay_from_secs(&format!("{}.base_retry_delay_secs", self.name), secs)?,
            None => config.base_retry_delay()?,
        };
        Ok(RetryPolicy::new(self.max_retries.unwrap_or(config.max_retries), base))
    }
}

/// Advisory per-attempt timeout for the built-in generative steps.
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// The built-in book pipeline, in declaration order.
pub fn default_pipeline() -> Vec<StepDescriptor> {
    let step = |name: &str| StepDescriptor::new(name).with_timeout_secs(DEFAULT_STEP_TIMEOUT_SECS);
    vec![
        step("outline"),
        step("writer").after(["outline"]),
        step("chapter").after(["writer"]),
        step("reviewer").after(["chapter"]),
        step("enhancer").after(["chapter"]),
        step("glossary").after(["chapter"]),
        step("quiz").after(["chapter"]),
        step("proofreader").after(["reviewer", "enhancer"]),
        StepDescriptor::new("quality").after(["proofreader", "glossary", "quiz"]),
        StepDescriptor::new("final").after(["quality"]),
    ]
}

/// Restrict `descriptors` to the steps named in `sequence`, in that order.
///
/// Names missing from `descriptors` are added without dependencies.
/// Dependencies on steps outside the selection are dropped with a warning,
/// so any subset stays runnable.
pub fn select(descriptors: &[StepDescriptor], sequence: &[String]) -> Vec<StepDescriptor> {
    let selected: HashSet<&str> = sequence.iter().map(String::as_str).collect();
    sequence
        .iter()
        .map(|name| {
            let mut descriptor = descriptors
                .iter()
                .find(|d| &d.name == name)
                .cloned()
                .unwrap_or_else(|| StepDescriptor::new(name.clone()));
            let step = descriptor.name.clone();
            descriptor.dependencies.retain(|dep| {
                let keep = selected.contains(dep.as_str());
                if !keep {
                    tracing::warn!(
                        step = %step,
                        dependency = %dep,
                        "Dropping dependency on a step outside agent_sequence"
                    );
                }
                keep
            });
            descriptor
        })
        .collect()
}

type StepFactory = Arc<dyn Fn() -> Arc<dyn StepHandler> + Send + Sync>;

struct Registration {
    factory: StepFactory,
    owns: Vec<String>,
}

/// Maps step names to handler factories.
#[derive(Default)]
pub struct StepRegistry {
    entries: HashMap<String, Registration>,
    order: Vec<String>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. Re-registering a name replaces the earlier entry.
    pub fn register<F>(&mut self, name: &str, owns: &[&str], factory: F)
    where
        F: Fn() -> Arc<dyn StepHandler> + Send + Sync + 'static,
    {
        let registration = Registration {
            factory: Arc::new(factory),
            owns: owns.iter().map(|k| k.to_string()).collect(),
        };
        if self.entries.insert(name.to_string(), registration).is_none() {
            self.order.push(name.to_string());
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Build a single unit from its descriptor.
    pub fn unit(&self, descriptor: &StepDescriptor, config: &EngineConfig) -> Result<StepUnit> {
        let registration = self
            .entries
            .get(&descriptor.name)
            .ok_or_else(|| FolioError::UnknownStep {
                name: descriptor.name.clone(),
            })?;
        let owns = if descriptor.owns.is_empty() {
            registration.owns.clone()
        } else {
            descriptor.owns.clone()
        };
        let mut unit = StepUnit::new(descriptor.name.clone(), (registration.factory)())
            .depends_on(descriptor.dependencies.clone())
            .with_retry(descriptor.retry_policy(config)?)
            .owns(owns);
        if let Some(secs) = descriptor.timeout_secs {
            unit = unit.with_timeout(Duration::from_secs(secs));
        }
        Ok(unit)
    }

    /// Build every unit of a pipeline definition.
    pub fn build(&self, descriptors: &[StepDescriptor], config: &EngineConfig) -> Result<Vec<StepUnit>> {
        descriptors.iter().map(|d| self.unit(d, config)).collect()
    }
}

/// Registry holding every built-in book step, backed by `generator`.
pub fn default_registry(generator: Arc<dyn Generator>) -> StepRegistry {
    let mut registry = StepRegistry::new();

    let generative: [(&'static str, &'static str, &'static str, &'static [&'static str]); 7] = [
        ("outline", "outline", "Write a chapter-by-chapter outline.", &[]),
        ("writer", "draft", "Write a first draft following the outline.", &["outline"]),
        ("chapter", "chapters", "Expand the draft into complete chapters.", &["outline", "draft"]),
        ("enhancer", "enhancements", "Suggest examples, diagrams and further reading.", &["chapters"]),
        ("glossary", "glossary", "Write a glossary of the key terms.", &["chapters"]),
        ("quiz", "quiz", "Write review questions with answers.", &["chapters"]),
        ("proofreader", "proofread_notes", "Proofread and list corrections.", &["chapters", "review_notes", "enhancements"]),
    ];
    for (name, key, instruction, reads) in generative {
        let generator = Arc::clone(&generator);
        registry.register(name, &[key], move || {
            Arc::new(
                GenerativeStep::new(name, key, instruction, Arc::clone(&generator))
                    .reads(reads.iter().copied()),
            )
        });
    }

    let review_keys = ReviewStep::owned_keys();
    let review_keys: Vec<&str> = review_keys.iter().map(String::as_str).collect();
    let g = Arc::clone(&generator);
    registry.register("reviewer", &review_keys, move || {
        Arc::new(ReviewStep::new("reviewer", Arc::clone(&g)))
    });

    let g = Arc::clone(&generator);
    registry.register("revise", &["chapters"], move || {
        Arc::new(ReviseStep::new("revise", Arc::clone(&g)))
    });

    registry.register("quality", &["quality_report"], || Arc::new(QualityCheckStep));
    registry.register("final", &[FinalStep::OUTPUT_KEY], || Arc::new(FinalStep));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::DryRunGenerator;

    fn registry() -> StepRegistry {
        default_registry(Arc::new(DryRunGenerator))
    }

    #[test]
    fn default_registry_covers_default_pipeline() {
        let registry = registry();
        for descriptor in default_pipeline() {
            assert!(registry.has(&descriptor.name), "{} missing", descriptor.name);
        }
        assert!(registry.has("revise"));
        assert_eq!(registry.names().len(), 11);
    }

    #[test]
    fn build_applies_config_and_overrides() {
        let config = EngineConfig {
            max_retries: 5,
            ..Default::default()
        };
        let mut descriptors = default_pipeline();
        descriptors[1].max_retries = Some(2);
        descriptors[1].base_retry_delay_secs = Some(0.25);

        let units = registry().build(&descriptors, &config).unwrap();
        assert_eq!(units.len(), descriptors.len());
        assert_eq!(units[0].retry.max_retries, 5);
        assert_eq!(units[1].retry, RetryPolicy::new(2, Duration::from_millis(250)));
        assert_eq!(units[1].dependencies, vec!["outline"]);
        assert!(units[1].owns_key("draft"));
        assert_eq!(units[0].timeout, Some(Duration::from_secs(300)));
        assert!(units[3].owns_key("engagement_score"));
    }

    #[test]
    fn unknown_step_is_rejected() {
        let descriptors = vec![StepDescriptor::new("outline"), StepDescriptor::new("illustrator")];
        match registry().build(&descriptors, &EngineConfig::default()) {
            Err(FolioError::UnknownStep { name }) => assert_eq!(name, "illustrator"),
            other => panic!("expected UnknownStep, got {:?}", other.map(|u| u.len())),
        }
    }

    #[test]
    fn out_of_range_delay_override_is_rejected() {
        let mut descriptor = StepDescriptor::new("outline");
        descriptor.base_retry_delay_secs = Some(1e30);
        assert!(matches!(
            registry().unit(&descriptor, &EngineConfig::default()),
            Err(FolioError::InvalidConfig(_))
        ));
    }

    #[test]
    fn select_drops_dependencies_outside_selection() {
        let sequence: Vec<String> = ["outline", "chapter", "final"].map(String::from).to_vec();
        let selected = select(&default_pipeline(), &sequence);

        let names: Vec<&str> = selected.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["outline", "chapter", "final"]);
        assert!(selected[1].dependencies.is_empty());
        assert!(selected[2].dependencies.is_empty());
    }

    #[test]
    fn select_keeps_dependencies_inside_selection() {
        let sequence: Vec<String> = ["outline", "writer", "revise"].map(String::from).to_vec();
        let selected = select(&default_pipeline(), &sequence);
        assert_eq!(selected[1].dependencies, vec!["outline"]);
        assert_eq!(selected[2], StepDescriptor::new("revise"));
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let d: StepDescriptor =
            serde_json::from_str(r#"{"name": "quiz", "dependencies": ["chapter"]}"#).unwrap();
        assert_eq!(d, StepDescriptor::new("quiz").after(["chapter"]));
    }

    #[tokio::test]
    async fn registered_factory_builds_working_handler() {
        let unit = registry()
            .unit(&StepDescriptor::new("outline"), &EngineConfig::default())
            .unwrap();
        let out = unit
            .handler
            .execute(folio_types::SharedState::new("Rust"))
            .await
            .unwrap();
        assert!(out.get_str("outline").contains("Rust"));
    }
}
