use crate::error::KilnResult;
use std::path::{Path, PathBuf};

/// Filesystem layout for everything the stores persist.
///
/// ```text
/// <root>/runs/<run_id>/run.json        run record (atomic write)
/// <root>/runs/<run_id>/logs.json       bounded log ring (atomic write)
/// <root>/runs/<run_id>/metrics.jsonl   append-only metric lines
/// <root>/checkpoints/<ckpt_id>.json    one checkpoint per file
/// ```
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    #[must_use]
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    #[must_use]
    pub fn run_record_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    #[must_use]
    pub fn run_logs_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("logs.json")
    }

    #[must_use]
    pub fn run_metrics_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("metrics.jsonl")
    }

    #[must_use]
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    #[must_use]
    pub fn checkpoint_path(&self, checkpoint_id: &str) -> PathBuf {
        self.checkpoints_dir().join(format!("{checkpoint_id}.json"))
    }

    /// Create the top-level directories if they do not exist yet.
    pub fn ensure(&self) -> KilnResult<()> {
        std::fs::create_dir_all(self.runs_dir())?;
        std::fs::create_dir_all(self.checkpoints_dir())?;
        Ok(())
    }

    pub fn ensure_run_dir(&self, run_id: &str) -> KilnResult<()> {
        std::fs::create_dir_all(self.run_dir(run_id))?;
        Ok(())
    }
}
