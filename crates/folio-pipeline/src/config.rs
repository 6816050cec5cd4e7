//! Engine configuration.
//!
//! Every field has a default, so a config file or dictionary only needs the
//! keys it wants to override. TOML is used for `.toml` files, JSON otherwise.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use folio_types::{FolioError, Result};

use crate::retry::RetryPolicy;

/// What to do with a step whose dependency failed permanently in this run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Treat the failed dependency as settled and run the step anyway. The
    /// document loses a section but the job still reaches its final step.
    #[default]
    Continue,
    /// Skip every step that depends, directly or not, on a failed step.
    SkipDependents,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_retry_delay_secs() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}
fn default_max_workers() -> usize {
    4
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}
fn default_quality_threshold() -> f64 {
    0.7
}
fn default_max_revisions() -> u32 {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts per step, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_retry_delay_secs")]
    pub base_retry_delay_secs: f64,
    #[serde(default = "default_true")]
    pub parallel_enabled: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Where the checkpoint and the compiled document are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Names of the registered steps to run, in declaration order. `None`
    /// runs the built-in pipeline.
    #[serde(default)]
    pub agent_sequence: Option<Vec<String>>,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Keep the checkpoint when a run finished with errors, so a resumed run
    /// retries the failed steps.
    #[serde(default)]
    pub keep_checkpoint_on_error: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_retry_delay_secs: default_base_retry_delay_secs(),
            parallel_enabled: true,
            max_workers: default_max_workers(),
            output_dir: default_output_dir(),
            agent_sequence: None,
            quality_threshold: default_quality_threshold(),
            max_revisions: default_max_revisions(),
            failure_policy: FailurePolicy::default(),
            keep_checkpoint_on_error: false,
        }
    }
}

/// Convert a configured delay in seconds. Rejects values that are not
/// positive or do not fit in a `Duration`.
pub(crate) fn retry_delay_from_secs(field: &str, secs: f64) -> Result<Duration> {
    if !(secs.is_finite() && secs > 0.0) {
        return Err(FolioError::InvalidConfig(format!(
            "{field} must be a positive number"
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| FolioError::InvalidConfig(format!("{field} is out of range: {e}")))
}

impl EngineConfig {
    pub fn base_retry_delay(&self) -> Result<Duration> {
        retry_delay_from_secs("base_retry_delay_secs", self.base_retry_delay_secs)
    }

    /// The retry policy applied to steps that do not declare their own.
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy::new(self.max_retries, self.base_retry_delay()?))
    }

    /// Load and validate a config file.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        let config: Self = if is_toml {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Build a config from a dictionary of overrides laid over the defaults.
    pub fn from_value(overrides: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(overrides) = overrides else {
            return Err(FolioError::InvalidConfig(
                "configuration overrides must be an object".into(),
            ));
        };
        let mut merged = match serde_json::to_value(Self::default())? {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        for (key, value) in overrides {
            if !merged.contains_key(&key) {
                tracing::warn!(key = %key, "Ignoring unknown configuration key");
                continue;
            }
            merged.insert(key, value);
        }
        let config: Self = serde_json::from_value(serde_json::Value::Object(merged))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, falling back to the defaults when the file is
    /// missing or invalid.
    pub async fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::from_file(path).await {
            Ok(config) => config,
            Err(FolioError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config found at {}, using defaults", path.display());
                Self::default()
            }
            Err(err) => {
                tracing::warn!("Failed to load {}: {err}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries < 1 {
            return Err(FolioError::InvalidConfig("max_retries must be at least 1".into()));
        }
        self.base_retry_delay()?;
        if self.max_workers < 1 {
            return Err(FolioError::InvalidConfig("max_workers must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(FolioError::InvalidConfig(
                "quality_threshold must be between 0 and 1".into(),
            ));
        }
        if let Some(sequence) = &self.agent_sequence {
            if sequence.is_empty() {
                return Err(FolioError::InvalidConfig("agent_sequence must not be empty".into()));
            }
        }
        Ok(())
    }
}
