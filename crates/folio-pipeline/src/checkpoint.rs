//! Checkpoint save/restore for crash recovery.
//!
//! After every step or batch the engine persists the full [`SharedState`] to
//! `<output_dir>/checkpoint.json`. On a resumed run the snapshot is loaded so
//! completed steps are skipped instead of generated again.

use std::path::{Path, PathBuf};

use folio_types::{Result, SharedState};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const TEMP_FILE: &str = "checkpoint.json.tmp";

/// File-backed store for one job's checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: output_dir.into(),
        }
    }

    /// Path of the checkpoint file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a snapshot of `state`.
    ///
    /// The JSON is written to a temporary file first and then renamed over
    /// the checkpoint, so a crash mid-write leaves the previous snapshot intact.
    pub async fn save(&self, state: &SharedState) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path();
        let tmp = self.dir.join(TEMP_FILE);
        let json = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(
            path = %path.display(),
            step = %state.current_step,
            completed = state.completed_steps.len(),
            "Checkpoint saved"
        );
        Ok(path)
    }

    /// Load the latest snapshot.
    ///
    /// Returns `Ok(None)` when no checkpoint exists (first run, or after
    /// [`CheckpointStore::clear`]).
    pub async fn load(&self) -> Result<Option<SharedState>> {
        let path = self.path();
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&path).await?;
        let state: SharedState = serde_json::from_str(&json)?;
        tracing::debug!(
            path = %path.display(),
            completed = state.completed_steps.len(),
            "Checkpoint loaded"
        );
        Ok(Some(state))
    }

    /// Delete the checkpoint after the pipeline reached its terminal step.
    pub async fn clear(&self) -> Result<()> {
        let path = self.path();
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&path).await?;
            tracing::debug!(path = %path.display(), "Checkpoint cleared");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
