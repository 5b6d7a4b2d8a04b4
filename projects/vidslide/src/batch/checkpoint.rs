// batch.json: everything needed to rebuild a batch after a restart.

use super::task::{ArchivedTask, TaskRecord, TaskState};
use super::RunStatus;
use crate::config::ExtractParams;
use crate::run_context::count_images;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_FILE: &str = "batch.json";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BatchCounters {
    pub completed_count: usize,
    pub failed_count: usize,
    pub total_images: usize,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Checkpoint {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub params: ExtractParams,
    pub max_workers: usize,
    #[serde(default)]
    pub counters: BatchCounters,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub archive: Vec<ArchivedTask>,
}

/// A checkpoint plus live-only fields, handed to listeners.
#[derive(Serialize, Debug, Clone)]
pub struct BatchSnapshot {
    #[serde(flatten)]
    pub state: Checkpoint,
    pub pausing: bool,
    pub global_progress: f64,
}

impl Checkpoint {
    pub fn new(id: String, params: ExtractParams, max_workers: usize) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            status: RunStatus::Idle,
            params,
            max_workers: max_workers.max(1),
            counters: BatchCounters::default(),
            tasks: Vec::new(),
            archive: Vec::new(),
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(CHECKPOINT_FILE)
    }

    /// Replaces the checkpoint file in one rename so readers never see a
    /// partial document.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)?;
        let tmp = dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        let path = Self::path(dir);
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        let content =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt checkpoint {}", path.display()))?;
        Ok(checkpoint)
    }

    /// Normalizes state loaded after a restart: nothing is running, the batch
    /// is idle and image counts match what is on disk.
    pub fn recover(mut self) -> Self {
        self.status = RunStatus::Idle;
        for task in &mut self.tasks {
            if task.state == TaskState::RUNNING {
                tracing::warn!(
                    "Checkpoint: task {} ({}) was interrupted",
                    task.id,
                    task.display_name
                );
                task.state = TaskState::ERROR;
                task.error = Some("interrupted by restart".to_string());
                task.message = "Interrupted".to_string();
                task.eta_seconds = None;
                self.counters.failed_count += 1;
            }
            let images = task.paths().images();
            if images.is_dir() {
                task.saved_count = count_images(&images);
            }
        }
        self
    }
}
