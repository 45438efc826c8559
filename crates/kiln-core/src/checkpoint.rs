//! Durable checkpoint store: snapshots of trainable state plus the resume
//! token needed to restart a loop where the snapshot was taken.
//!
//! One JSON file per checkpoint under `checkpoints/`, addressable by id
//! across runs. `latest` is a moving pointer: saving a new `latest` for a
//! run removes its previous one, while `best` and `manual` accumulate.

use crate::error::{KilnError, KilnResult};
use crate::io::{atomic_write_json, read_json};
use crate::layout::DataLayout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTag {
    Latest,
    Best,
    Manual,
}

impl std::fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Latest => "latest",
            Self::Best => "best",
            Self::Manual => "manual",
        };
        f.pad(s)
    }
}

/// Epoch/step cursor plus opaque optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeToken {
    pub epoch: u32,
    pub step: u32,
    pub optimizer: serde_json::Value,
}

/// Full persisted checkpoint record, including the opaque weights payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub tag: CheckpointTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<f64>,
    pub weights: serde_json::Value,
    pub resume: ResumeToken,
}

impl Checkpoint {
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        weights: serde_json::Value,
        resume: ResumeToken,
        tag: CheckpointTag,
        metric: Option<f64>,
    ) -> Self {
        Self {
            id: format!("ckpt-{}", Uuid::new_v4()),
            run_id: run_id.into(),
            created_at: Utc::now(),
            tag,
            metric,
            weights,
            resume,
        }
    }
}

/// Listing view of a checkpoint, without the weights payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMeta {
    pub id: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub tag: CheckpointTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<f64>,
}

pub struct CheckpointStore {
    layout: DataLayout,
    // serializes save/delete so writes for a run are never concurrent
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn open(layout: DataLayout) -> KilnResult<Self> {
        layout.ensure()?;
        Ok(Self { layout, write_lock: Mutex::new(()) })
    }

    /// Persist a checkpoint atomically and return its path.
    ///
    /// For `latest`-tagged saves the run's previous `latest` file is removed
    /// after the new one lands, so a failure mid-save never leaves the run
    /// without a resumable latest checkpoint.
    pub fn save(&self, checkpoint: &Checkpoint) -> KilnResult<PathBuf> {
        let _guard = self.write_lock.lock().map_err(|_| lock_poisoned())?;

        let previous_latest = if checkpoint.tag == CheckpointTag::Latest {
            self.scan(Some(&checkpoint.run_id))?
                .into_iter()
                .filter(|meta| meta.tag == CheckpointTag::Latest && meta.id != checkpoint.id)
                .collect()
        } else {
            Vec::new()
        };

        let path = self.layout.checkpoint_path(&checkpoint.id);
        atomic_write_json(&path, checkpoint)?;
        debug!(
            checkpoint_id = %checkpoint.id,
            run_id = %checkpoint.run_id,
            tag = %checkpoint.tag,
            "saved checkpoint"
        );

        for stale in previous_latest {
            let stale_path = self.layout.checkpoint_path(&stale.id);
            if let Err(e) = fs::remove_file(&stale_path) {
                warn!("failed to remove superseded latest checkpoint {}: {}", stale.id, e);
            }
        }

        Ok(path)
    }

    /// Load a full checkpoint by id.
    pub fn load(&self, checkpoint_id: &str) -> KilnResult<Checkpoint> {
        let path = self.layout.checkpoint_path(checkpoint_id);
        if !path.exists() {
            return Err(KilnError::NotFound(format!("checkpoint: {checkpoint_id}")));
        }
        read_json(&path)
    }

    /// Checkpoint metadata, newest first, optionally filtered by run.
    pub fn list(&self, run_id: Option<&str>) -> KilnResult<Vec<CheckpointMeta>> {
        let mut metas = self.scan(run_id)?;
        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(metas)
    }

    /// The run's current `latest` checkpoint, if any.
    pub fn latest_for(&self, run_id: &str) -> KilnResult<Option<CheckpointMeta>> {
        Ok(self.list(Some(run_id))?.into_iter().find(|m| m.tag == CheckpointTag::Latest))
    }

    /// The run's most recent `best` checkpoint, if any.
    pub fn best_for(&self, run_id: &str) -> KilnResult<Option<CheckpointMeta>> {
        Ok(self.list(Some(run_id))?.into_iter().find(|m| m.tag == CheckpointTag::Best))
    }

    pub fn delete(&self, checkpoint_id: &str) -> KilnResult<()> {
        let _guard = self.write_lock.lock().map_err(|_| lock_poisoned())?;
        let path = self.layout.checkpoint_path(checkpoint_id);
        if !path.exists() {
            return Err(KilnError::NotFound(format!("checkpoint: {checkpoint_id}")));
        }
        fs::remove_file(&path)?;
        debug!(checkpoint_id = %checkpoint_id, "deleted checkpoint");
        Ok(())
    }

    fn scan(&self, run_id: Option<&str>) -> KilnResult<Vec<CheckpointMeta>> {
        let dir = self.layout.checkpoints_dir();
        let mut metas = Vec::new();
        if !dir.exists() {
            return Ok(metas);
        }

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<CheckpointMeta>(&path) {
                Ok(meta) => {
                    if run_id.is_none_or(|id| meta.run_id == id) {
                        metas.push(meta);
                    }
                }
                Err(e) => {
                    warn!("skipping unreadable checkpoint {}: {}", path.display(), e);
                }
            }
        }
        Ok(metas)
    }
}

fn lock_poisoned() -> KilnError {
    KilnError::Other(anyhow::anyhow!("checkpoint store lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> CheckpointStore {
        CheckpointStore::open(DataLayout::new(temp.path())).unwrap()
    }

    fn token(epoch: u32, step: u32) -> ResumeToken {
        ResumeToken { epoch, step, optimizer: json!({ "momentum": [0.1, 0.2] }) }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        let checkpoint = Checkpoint::new(
            "run-a",
            json!({ "w": [1.0, 2.0] }),
            token(1, 2),
            CheckpointTag::Manual,
            Some(0.42),
        );
        let path = store.save(&checkpoint).unwrap();
        assert!(path.exists());

        let loaded = store.load(&checkpoint.id).unwrap();
        assert_eq!(loaded.run_id, "run-a");
        assert_eq!(loaded.tag, CheckpointTag::Manual);
        assert_eq!(loaded.resume, token(1, 2));
        assert_eq!(loaded.weights, json!({ "w": [1.0, 2.0] }));
        assert_eq!(loaded.metric, Some(0.42));
    }

    #[test]
    fn test_load_unknown_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        assert!(matches!(store.load("ckpt-ghost"), Err(KilnError::NotFound(_))));
    }

    #[test]
    fn test_latest_is_a_moving_pointer() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        let first =
            Checkpoint::new("run-a", json!({}), token(1, 2), CheckpointTag::Latest, Some(0.9));
        let second =
            Checkpoint::new("run-a", json!({}), token(1, 4), CheckpointTag::Latest, Some(0.8));
        let best = Checkpoint::new("run-a", json!({}), token(1, 3), CheckpointTag::Best, Some(0.7));

        store.save(&first).unwrap();
        store.save(&best).unwrap();
        store.save(&second).unwrap();

        // the previous latest is gone, best is untouched
        assert!(matches!(store.load(&first.id), Err(KilnError::NotFound(_))));
        assert!(store.load(&best.id).is_ok());

        let latest = store.latest_for("run-a").unwrap().unwrap();
        assert_eq!(latest.id, second.id);

        let latest_count = store
            .list(Some("run-a"))
            .unwrap()
            .iter()
            .filter(|m| m.tag == CheckpointTag::Latest)
            .count();
        assert_eq!(latest_count, 1);
    }

    #[test]
    fn test_latest_pointer_is_scoped_per_run() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        let a = Checkpoint::new("run-a", json!({}), token(1, 2), CheckpointTag::Latest, None);
        let b = Checkpoint::new("run-b", json!({}), token(1, 2), CheckpointTag::Latest, None);
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        assert!(store.load(&a.id).is_ok());
        assert!(store.load(&b.id).is_ok());
    }

    #[test]
    fn test_list_is_newest_first_and_filters_by_run() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        let mut older = Checkpoint::new("run-a", json!({}), token(1, 1), CheckpointTag::Best, None);
        older.created_at = Utc::now() - chrono::Duration::seconds(60);
        let newer = Checkpoint::new("run-a", json!({}), token(2, 1), CheckpointTag::Best, None);
        let other = Checkpoint::new("run-b", json!({}), token(1, 1), CheckpointTag::Manual, None);

        store.save(&older).unwrap();
        store.save(&newer).unwrap();
        store.save(&other).unwrap();

        let all = store.list(None).unwrap();
        assert_eq!(all.len(), 3);

        let for_a = store.list(Some("run-a")).unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].id, newer.id);
        assert_eq!(for_a[1].id, older.id);
    }

    #[test]
    fn test_list_skips_unreadable_files() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        let good = Checkpoint::new("run-a", json!({}), token(1, 1), CheckpointTag::Manual, None);
        store.save(&good).unwrap();
        fs::write(temp.path().join("checkpoints").join("junk.json"), "{oops").unwrap();

        let all = store.list(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, good.id);
    }

    #[test]
    fn test_delete_removes_and_is_not_found_twice() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        let checkpoint = Checkpoint::new("run-a", json!({}), token(1, 1), CheckpointTag::Manual, None);
        store.save(&checkpoint).unwrap();

        store.delete(&checkpoint.id).unwrap();
        assert!(matches!(store.load(&checkpoint.id), Err(KilnError::NotFound(_))));
        assert!(matches!(store.delete(&checkpoint.id), Err(KilnError::NotFound(_))));
    }
}
