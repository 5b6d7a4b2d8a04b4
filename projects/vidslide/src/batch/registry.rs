use super::checkpoint::CHECKPOINT_FILE;
use super::scheduler::{Batch, BatchServices};
use super::RunStatus;
use crate::config::ExtractParams;
use crate::error::BatchError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// One line of the batch listing.
#[derive(Serialize, Debug, Clone)]
pub struct BatchSummary {
    pub id: String,
    pub dir: PathBuf,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub task_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub global_progress: f64,
}

/// Every batch under one root directory, keyed by batch id.
pub struct BatchRegistry {
    root: PathBuf,
    services: BatchServices,
    batches: RwLock<HashMap<String, Arc<Batch>>>,
}

impl BatchRegistry {
    pub fn new(root: impl Into<PathBuf>, services: BatchServices) -> Self {
        Self {
            root: root.into(),
            services,
            batches: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn register(&self, batch: Arc<Batch>) {
        self.batches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(batch.id().to_string(), batch);
    }

    pub fn create(&self, params: ExtractParams, max_workers: usize) -> Result<Arc<Batch>, BatchError> {
        let batch = Batch::create(&self.root, params, max_workers, self.services.clone())?;
        self.register(batch.clone());
        Ok(batch)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Batch>> {
        self.batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Summaries, oldest batch first.
    pub fn list(&self) -> Vec<BatchSummary> {
        let batches: Vec<Arc<Batch>> = self
            .batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut summaries: Vec<BatchSummary> = batches
            .iter()
            .map(|batch| {
                let snapshot = batch.snapshot();
                BatchSummary {
                    id: snapshot.state.id.clone(),
                    dir: batch.dir().to_path_buf(),
                    status: snapshot.state.status,
                    created_at: snapshot.state.created_at,
                    task_count: snapshot.state.tasks.len(),
                    completed_count: snapshot.state.counters.completed_count,
                    failed_count: snapshot.state.counters.failed_count,
                    global_progress: snapshot.global_progress,
                }
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// Stops a batch, waits for its workers and deletes its directory.
    pub async fn remove(&self, id: &str) -> Result<(), BatchError> {
        let batch = self
            .batches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| BatchError::BatchNotFound(id.to_string()))?;
        batch.close();
        batch.wait_idle().await;
        fs::remove_dir_all(batch.dir())?;
        tracing::info!("Registry: removed batch {}", id);
        Ok(())
    }

    /// Reloads every batch found under the root. Unreadable batches are
    /// logged and skipped. Returns how many were recovered.
    pub fn recover(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir() && p.join(CHECKPOINT_FILE).is_file())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("batch_"))
            })
            .collect();
        dirs.sort();

        let mut recovered = 0;
        for dir in dirs {
            match Batch::open(&dir, self.services.clone()) {
                Ok(batch) => {
                    self.register(batch);
                    recovered += 1;
                }
                Err(e) => tracing::error!("Registry: cannot recover {}: {}", dir.display(), e),
            }
        }
        tracing::info!("Registry: recovered {} batches from {}", recovered, self.root.display());
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::testing::*;
    use crate::batch::TaskState;
    use std::sync::Arc;

    fn registry(root: &Path) -> BatchRegistry {
        let services = BatchServices {
            extractor: Arc::new(FakeExtractor::new(2)),
            probe: Arc::new(FakeProbe),
            space: Arc::new(FakeSpace(None)),
        };
        BatchRegistry::new(root, services)
    }

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("vidslide-registry-{}-{}", tag, uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[tokio::test]
    async fn test_recover_reloads_batches() {
        let root = temp_root("recover");
        let first = registry(&root);
        let batch = first.create(ExtractParams::default(), 1).unwrap();
        let task = batch
            .ingest(crate::batch::IngestEntry::new(root.join("a.mp4")))
            .unwrap();
        batch.enqueue(&[task.id.clone()]).unwrap();
        fs::create_dir_all(root.join("batch_junk")).unwrap();
        fs::write(root.join("batch_junk").join(CHECKPOINT_FILE), b"not json").unwrap();

        let second = registry(&root);
        assert_eq!(second.recover(), 1);
        let reloaded = second.get(batch.id()).unwrap();
        assert_eq!(reloaded.task(&task.id).unwrap().state, TaskState::WAITING);
        assert_eq!(second.list().len(), 1);
        fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_remove_deletes_directory() {
        let root = temp_root("remove");
        let registry = registry(&root);
        let batch = registry.create(ExtractParams::default(), 1).unwrap();
        let dir = batch.dir().to_path_buf();
        assert!(dir.is_dir());

        registry.remove(batch.id()).await.unwrap();
        assert!(!dir.exists());
        assert!(registry.get(batch.id()).is_none());
        assert!(registry.remove(batch.id()).await.is_err());
        fs::remove_dir_all(&root).ok();
    }
}
