//! Process-wide registry of documents with a run in flight.
//!
//! A second run for a document that is already active is rejected with
//! [`FolioError::JobConflict`]; it is never queued. A run also claims the
//! output directory that holds its checkpoint, so two documents never share
//! one checkpoint file at the same time. The returned guard frees both
//! claims when dropped, so every exit path of a run releases them.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use folio_types::{FolioError, Result};

#[derive(Debug, Default)]
struct Claims {
    ids: HashSet<String>,
    /// Output directory -> document holding it.
    dirs: HashMap<PathBuf, String>,
}

#[derive(Debug, Default)]
pub struct ActiveJobs {
    claims: Mutex<Claims>,
}

impl ActiveJobs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The set shared by every engine in this process.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ActiveJobs>> = OnceLock::new();
        GLOBAL.get_or_init(ActiveJobs::new).clone()
    }

    fn claims(&self) -> MutexGuard<'_, Claims> {
        self.claims.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark `document_id` active, or fail if it already is.
    pub fn try_acquire(self: &Arc<Self>, document_id: &str) -> Result<ActiveJobGuard> {
        let mut claims = self.claims();
        Self::claim_id(&mut claims, document_id)?;
        Ok(self.guard(document_id, None))
    }

    /// Mark `document_id` active and claim `output_dir` for it.
    ///
    /// Fails with [`FolioError::JobConflict`] if the document is already
    /// running, or [`FolioError::OutputDirBusy`] if another document's run
    /// holds the directory. Nothing is claimed on failure.
    pub fn try_acquire_in(
        self: &Arc<Self>,
        document_id: &str,
        output_dir: &Path,
    ) -> Result<ActiveJobGuard> {
        let dir = std::path::absolute(output_dir).unwrap_or_else(|_| output_dir.to_path_buf());
        let mut claims = self.claims();
        if !claims.ids.contains(document_id) {
            if let Some(holder) = claims.dirs.get(&dir) {
                tracing::warn!(
                    document = %document_id,
                    holder = %holder,
                    dir = %dir.display(),
                    "Rejecting run: output directory in use"
                );
                return Err(FolioError::OutputDirBusy {
                    dir: dir.display().to_string(),
                    holder: holder.clone(),
                });
            }
        }
        Self::claim_id(&mut claims, document_id)?;
        claims.dirs.insert(dir.clone(), document_id.to_string());
        Ok(self.guard(document_id, Some(dir)))
    }

    fn claim_id(claims: &mut Claims, document_id: &str) -> Result<()> {
        if !claims.ids.insert(document_id.to_string()) {
            tracing::warn!(document = %document_id, "Rejecting run: job already in flight");
            return Err(FolioError::JobConflict {
                document_id: document_id.to_string(),
            });
        }
        Ok(())
    }

    fn guard(self: &Arc<Self>, document_id: &str, dir: Option<PathBuf>) -> ActiveJobGuard {
        ActiveJobGuard {
            jobs: Arc::clone(self),
            document_id: document_id.to_string(),
            dir,
        }
    }

    pub fn is_active(&self, document_id: &str) -> bool {
        self.claims().ids.contains(document_id)
    }

    pub fn len(&self) -> usize {
        self.claims().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims().ids.is_empty()
    }
}

/// Holds a document's slot in [`ActiveJobs`] until dropped.
#[derive(Debug)]
pub struct ActiveJobGuard {
    jobs: Arc<ActiveJobs>,
    document_id: String,
    dir: Option<PathBuf>,
}

impl ActiveJobGuard {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        let mut claims = self.jobs.claims();
        claims.ids.remove(&self.document_id);
        if let Some(dir) = &self.dir {
            claims.dirs.remove(dir);
        }
    }
}
