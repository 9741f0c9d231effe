use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::EtlError;
use crate::types::Offset;
use crate::Result;

/// Durable per-task marker of the last fully processed change.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, task: &str) -> Result<Option<Offset>>;

    /// Persists `offset` before returning. Offsets at or below the stored one
    /// are ignored so a checkpoint never moves backwards.
    async fn commit(&self, task: &str, offset: Offset) -> Result<()>;

    async fn clear(&self, task: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    offsets: DashMap<String, Offset>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, task: &str) -> Result<Option<Offset>> {
        Ok(self.offsets.get(task).map(|entry| *entry.value()))
    }

    async fn commit(&self, task: &str, offset: Offset) -> Result<()> {
        let mut entry = self.offsets.entry(task.to_string()).or_insert(offset);
        if offset > *entry {
            *entry = offset;
        }
        Ok(())
    }

    async fn clear(&self, task: &str) -> Result<()> {
        self.offsets.remove(task);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointRecord {
    task: String,
    offset: Offset,
    updated_at: DateTime<Utc>,
}

/// One JSON file per task. Writes go to a temporary file that is synced and
/// renamed over the previous checkpoint.
pub struct FileCheckpointStore {
    directory: PathBuf,
    cache: DashMap<String, Offset>,
}

impl FileCheckpointStore {
    pub async fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&directory).await?;
        Ok(Self {
            directory,
            cache: DashMap::new(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, task: &str) -> PathBuf {
        let file_name: String = task
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.directory.join(format!("{file_name}.checkpoint"))
    }

    async fn read_record(&self, task: &str) -> Result<Option<CheckpointRecord>> {
        let path = self.path_for(task);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: CheckpointRecord = serde_json::from_slice(&content).map_err(|e| {
            EtlError::Checkpoint(format!("corrupt checkpoint {}: {}", path.display(), e))
        })?;
        if record.task != task {
            return Err(EtlError::Checkpoint(format!(
                "checkpoint {} belongs to task '{}'",
                path.display(),
                record.task
            )));
        }
        Ok(Some(record))
    }

    async fn write_record(&self, record: &CheckpointRecord) -> Result<()> {
        let path = self.path_for(&record.task);
        let temp = path.with_extension("checkpoint.tmp");
        let content = serde_json::to_vec(record)?;

        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &path).await?;

        // The rename itself is only durable once the directory is synced.
        match tokio::fs::File::open(&self.directory).await {
            Ok(dir) => {
                if let Err(e) = dir.sync_all().await {
                    debug!("Directory sync for {} failed: {}", self.directory.display(), e);
                }
            }
            Err(e) => debug!("Cannot open {} for sync: {}", self.directory.display(), e),
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, task: &str) -> Result<Option<Offset>> {
        if let Some(offset) = self.cache.get(task) {
            return Ok(Some(*offset));
        }

        let offset = self.read_record(task).await?.map(|record| record.offset);
        if let Some(offset) = offset {
            self.cache.insert(task.to_string(), offset);
        }
        Ok(offset)
    }

    async fn commit(&self, task: &str, offset: Offset) -> Result<()> {
        if let Some(current) = self.load(task).await? {
            if offset <= current {
                if offset < current {
                    warn!(
                        "Ignoring checkpoint regression for task '{}': {} < {}",
                        task, offset, current
                    );
                }
                return Ok(());
            }
        }

        let record = CheckpointRecord {
            task: task.to_string(),
            offset,
            updated_at: Utc::now(),
        };
        self.write_record(&record).await?;
        self.cache.insert(task.to_string(), offset);
        debug!("Checkpointed task '{}' at offset {}", task, offset);
        Ok(())
    }

    async fn clear(&self, task: &str) -> Result<()> {
        self.cache.remove(task);
        match tokio::fs::remove_file(self.path_for(task)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store_is_monotonic() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.load("task").await.unwrap(), None);

        store.commit("task", 5).await.unwrap();
        store.commit("task", 3).await.unwrap();
        assert_eq!(store.load("task").await.unwrap(), Some(5));

        store.commit("task", 9).await.unwrap();
        assert_eq!(store.load("task").await.unwrap(), Some(9));

        store.clear("task").await.unwrap();
        assert_eq!(store.load("task").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileCheckpointStore::open(dir.path()).await.unwrap();
            store.commit("KafkaEtlTaskName", 12).await.unwrap();
            store.commit("KafkaEtlTaskName", 4).await.unwrap();
        }

        let reopened = FileCheckpointStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.load("KafkaEtlTaskName").await.unwrap(), Some(12));
        assert_eq!(reopened.load("other").await.unwrap(), None);
        assert!(!dir.path().join("KafkaEtlTaskName.checkpoint.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_sanitizes_names_and_clears() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        store.commit("tasks/orders etl", 1).await.unwrap();
        assert!(dir.path().join("tasks_orders_etl.checkpoint").exists());

        store.clear("tasks/orders etl").await.unwrap();
        assert!(!dir.path().join("tasks_orders_etl.checkpoint").exists());
        assert_eq!(store.load("tasks/orders etl").await.unwrap(), None);
        store.clear("tasks/orders etl").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.checkpoint"), b"not json").unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        assert!(matches!(store.load("broken").await, Err(EtlError::Checkpoint(_))));
    }
}
