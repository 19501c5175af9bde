use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crawler::types::{CookieRecord, PageFailure, StorageRecord};

/// Current checkpoint schema version. Readers accept any file at or below
/// this version (unknown fields are ignored); newer files are rejected.
pub const CHECKPOINT_VERSION: u32 = 1;

fn current_version() -> u32 {
    CHECKPOINT_VERSION
}

/// Durable snapshot of an in-progress scaled crawl, enabling resume after a
/// crash or cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "current_version")]
    pub version: u32,
    pub job_id: String,
    pub site: String,
    /// Pages already attempted (scanned or failed); never re-scanned on resume.
    pub completed: Vec<String>,
    /// Pages still to scan, in order.
    pub pending: Vec<String>,
    #[serde(default)]
    pub cookies: Vec<CookieRecord>,
    #[serde(default)]
    pub storage: Vec<StorageRecord>,
    #[serde(default)]
    pub failures: Vec<PageFailure>,
    #[serde(default)]
    pub pages_scanned: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage for crawl checkpoints, keyed by job id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn load(&self, job_id: &str) -> Result<Option<Checkpoint>>;
    async fn delete(&self, job_id: &str) -> Result<()>;
}

/// Checkpoints as JSON files in a directory, one per job id. Writes go
/// through a temp file and rename so a crash mid-write never corrupts the
/// previous checkpoint.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .context(format!("Failed to create checkpoint directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.job_id);
        let tmp = self.dir.join(format!("{}.json.tmp", checkpoint.job_id));

        let contents = serde_json::to_vec_pretty(checkpoint)
            .context("Failed to serialize checkpoint")?;

        tokio::fs::write(&tmp, contents)
            .await
            .context(format!("Failed to write checkpoint file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .context(format!("Failed to finalize checkpoint file: {}", path.display()))?;

        debug!(
            "Checkpoint saved for job {}: {} completed, {} pending",
            checkpoint.job_id,
            checkpoint.completed.len(),
            checkpoint.pending.len()
        );

        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(job_id);

        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).context(format!(
                    "Failed to read checkpoint file: {}",
                    path.display()
                ))
            }
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&contents)
            .context(format!("Failed to parse checkpoint file: {}", path.display()))?;

        if checkpoint.version > CHECKPOINT_VERSION {
            anyhow::bail!(
                "Checkpoint {} was written by a newer version (v{}, supported up to v{})",
                job_id,
                checkpoint.version,
                CHECKPOINT_VERSION
            );
        }

        Ok(Some(checkpoint))
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        let path = self.path_for(job_id);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Checkpoint deleted for job {}", job_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(format!(
                "Failed to delete checkpoint file: {}",
                path.display()
            )),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// In-memory checkpoint store that counts writes, for engine tests.
    #[derive(Default)]
    pub struct MemoryCheckpointStore {
        entries: Mutex<HashMap<String, Checkpoint>>,
        saves: AtomicUsize,
    }

    impl MemoryCheckpointStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn save_count(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }

        pub async fn insert(&self, checkpoint: Checkpoint) {
            self.entries
                .lock()
                .await
                .insert(checkpoint.job_id.clone(), checkpoint);
        }

        pub async fn contains(&self, job_id: &str) -> bool {
            self.entries.lock().await.contains_key(job_id)
        }
    }

    #[async_trait]
    impl CheckpointStore for MemoryCheckpointStore {
        async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.entries
                .lock()
                .await
                .insert(checkpoint.job_id.clone(), checkpoint.clone());
            Ok(())
        }

        async fn load(&self, job_id: &str) -> Result<Option<Checkpoint>> {
            Ok(self.entries.lock().await.get(job_id).cloned())
        }

        async fn delete(&self, job_id: &str) -> Result<()> {
            self.entries.lock().await.remove(job_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(job_id: &str) -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            job_id: job_id.to_string(),
            site: "https://example.com".to_string(),
            completed: vec!["https://example.com/a".to_string()],
            pending: vec!["https://example.com/b".to_string()],
            cookies: vec![],
            storage: vec![],
            failures: vec![],
            pages_scanned: 1,
            started_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_load_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().to_path_buf()).unwrap();

        let cp = checkpoint("job-1");
        store.save(&cp).await.unwrap();

        let loaded = store.load("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.completed, cp.completed);
        assert_eq!(loaded.pending, cp.pending);
        assert_eq!(loaded.pages_scanned, 1);

        store.delete("job-1").await.unwrap();
        assert!(store.load("job-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_checkpoint_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().to_path_buf()).unwrap();

        assert!(store.load("nope").await.unwrap().is_none());
        store.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn newer_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().to_path_buf()).unwrap();

        let mut cp = checkpoint("future");
        cp.version = CHECKPOINT_VERSION + 1;
        store.save(&cp).await.unwrap();

        assert!(store.load("future").await.is_err());
    }

    #[tokio::test]
    async fn unknown_fields_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().to_path_buf()).unwrap();

        let mut raw = serde_json::to_value(checkpoint("compat")).unwrap();
        raw["an_unknown_future_field"] = serde_json::json!({"x": 1});
        std::fs::write(
            dir.path().join("compat.json"),
            serde_json::to_vec(&raw).unwrap(),
        )
        .unwrap();

        let loaded = store.load("compat").await.unwrap().unwrap();
        assert_eq!(loaded.job_id, "compat");
    }
}
