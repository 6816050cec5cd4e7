//! Shared types, errors, and state for the Folio document pipeline.
//!
//! This crate provides the foundational types used across the other Folio crates:
//! - `FolioError`: unified error taxonomy
//! - `SharedState`: the single mutable record threaded through every step
//! - `Generator`: the boundary to the external text-generation service

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unified error type for all Folio subsystems.
#[derive(Debug, thiserror::Error)]
pub enum FolioError {
    // === Step Errors ===
    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Generation failed: {message}")]
    Generation { message: String },

    // === Pipeline Definition Errors ===
    #[error("Dependency cycle detected involving step '{step}'")]
    CycleDetected { step: String },

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Step '{step}' is declared more than once")]
    DuplicateStep { step: String },

    #[error("No step registered under the name '{name}'")]
    UnknownStep { name: String },

    // === Run Errors ===
    #[error("A job for document '{document_id}' is already in flight")]
    JobConflict { document_id: String },

    #[error("Output directory '{dir}' is in use by the job for '{holder}'")]
    OutputDirBusy { dir: String, holder: String },

    #[error("Pipeline run was cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl FolioError {
    /// Returns `true` for errors in the pipeline definition itself. These abort
    /// a run before any step executes.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            FolioError::CycleDetected { .. }
                | FolioError::UnknownDependency { .. }
                | FolioError::DuplicateStep { .. }
                | FolioError::UnknownStep { .. }
        )
    }
}

/// A convenience alias for `Result<T, FolioError>`.
pub type Result<T> = std::result::Result<T, FolioError>;

// ---------------------------------------------------------------------------
// SharedState: the document-generation record
// ---------------------------------------------------------------------------

fn initial_step() -> String {
    "initialized".to_string()
}

/// The single mutable record threaded through a pipeline run.
///
/// Step handlers receive an owned copy and return the mutated record. The
/// engine is the only writer of the bookkeeping fields (`completed_steps`,
/// `step_start_times`, `progress_log`); handlers write `payload`, `errors`
/// and `warnings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    /// Opaque identifier of the generation job (the book topic).
    pub document_id: String,
    /// Names of finished steps, in completion order. Never shrinks.
    #[serde(default)]
    pub completed_steps: Vec<String>,
    /// Name of the step last entered. Diagnostic only.
    #[serde(default = "initial_step")]
    pub current_step: String,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    /// First observed start time per step. Written once.
    #[serde(default)]
    pub step_start_times: BTreeMap<String, DateTime<Utc>>,
    /// Every successful step execution, in order. Re-runs of a step (review
    /// after a revision) appear more than once.
    #[serde(default)]
    pub progress_log: Vec<String>,
    /// How many revise rounds the quality gate has triggered.
    #[serde(default)]
    pub revision_rounds: u32,
    #[serde(default)]
    pub generation_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub generation_completed: Option<DateTime<Utc>>,
    /// Content produced by the steps. The pipeline never interprets it.
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl SharedState {
    /// Create a fresh state for the given document.
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            completed_steps: Vec::new(),
            current_step: initial_step(),
            errors: Vec::new(),
            warnings: Vec::new(),
            last_modified: None,
            step_start_times: BTreeMap::new(),
            progress_log: Vec::new(),
            revision_rounds: 0,
            generation_started: None,
            generation_completed: None,
            payload: serde_json::Map::new(),
        }
    }

    pub fn is_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// Add `step` to `completed_steps`. Returns `false` if it was already there.
    pub fn mark_completed(&mut self, step: &str) -> bool {
        if self.is_completed(step) {
            return false;
        }
        self.completed_steps.push(step.to_string());
        true
    }

    /// Record the start time of `step` unless one is already recorded.
    pub fn record_start(&mut self, step: &str) {
        self.step_start_times
            .entry(step.to_string())
            .or_insert_with(Utc::now);
    }

    /// Bump `last_modified` to now.
    pub fn touch(&mut self) {
        self.last_modified = Some(Utc::now());
    }

    /// Append a `"{step}: {error}"` entry to `errors`.
    pub fn push_error(&mut self, step: &str, error: impl std::fmt::Display) {
        self.errors.push(format!("{step}: {error}"));
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Read a payload value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }

    /// Convenience accessor returning a payload string, or `""` when the key is
    /// absent or not a JSON string.
    pub fn get_str(&self, key: &str) -> &str {
        self.payload
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(|v| v.as_f64())
    }

    /// Insert or overwrite a payload key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.payload.insert(key.into(), value.into());
    }
}

// ---------------------------------------------------------------------------
// Generator: the external text-generation service
// ---------------------------------------------------------------------------

/// Input to one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Name of the step issuing the call.
    pub step: String,
    pub prompt: String,
    pub system: Option<String>,
}

impl GenerationRequest {
    pub fn new(step: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            prompt: prompt.into(),
            system: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// The opaque `Generate(input) -> (output, error)` operation.
///
/// Implementations must tolerate being called concurrently from several
/// workers and must not assume any particular task or thread.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<String>;
}
