// A batch of videos moving through the unselected / queue / completed zones.
//
// All state lives behind one mutex. Operations lock, mutate, copy out what
// they need and release before doing slow work (probing, events, disk).

use super::admission::{SpaceProbe, SystemSpace, WorkerSlots};
use super::checkpoint::{BatchSnapshot, Checkpoint};
use super::dispatcher;
use super::events::{BatchEvent, EventHub};
use super::task::{ArchiveReason, ArchivedTask, CancelIntent, RestoreMode, TaskRecord, TaskState};
use super::RunStatus;
use crate::config::{ExtractParams, CHECKPOINT_INTERVAL};
use crate::error::BatchError;
use crate::extract::{
    CancelFlag, ExtractJob, ExtractOutcome, Extractor, Progress, ResumePoint, SceneExtractor,
};
use crate::naming::sanitize_dirname;
use crate::package::Packager;
use crate::run_context::{count_images, list_images, safe_file_name};
use crate::video::probe::{DefaultProbe, MetadataProbe};
use crate::video::VideoMetadata;
use chrono::Utc;
use futures::Stream;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, watch};

const ARCHIVE_DIR: &str = ".archive";

/// Collaborators a batch drives. Swapped for fakes in tests.
#[derive(Clone)]
pub struct BatchServices {
    pub extractor: Arc<dyn Extractor>,
    pub probe: Arc<dyn MetadataProbe>,
    pub space: Arc<dyn SpaceProbe>,
}

impl BatchServices {
    pub fn system() -> Self {
        Self {
            extractor: Arc::new(SceneExtractor),
            probe: Arc::new(DefaultProbe),
            space: Arc::new(SystemSpace),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestEntry {
    pub path: PathBuf,
    pub display_name: Option<String>,
}

impl IngestEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            display_name: None,
        }
    }

    fn resolved_name(&self) -> String {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| {
                self.path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "unnamed".to_string())
    }
}

/// Acknowledgement of a request that may finish later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Done,
    /// The task is running; the transition happens when its worker stops.
    InProgress,
}

/// A task directory to move into the archive after the lock is released.
struct PendingMove {
    task_id: String,
    from: PathBuf,
    to: PathBuf,
}

/// Everything a worker needs, copied out when a task is claimed.
pub(crate) struct Claim {
    pub id: String,
    pub job: ExtractJob,
    pub cancel: CancelFlag,
    pub needs_probe: bool,
}

struct BatchInner {
    state: Checkpoint,
    pause_requested: bool,
    slots: WorkerSlots,
    run_started: Option<Instant>,
    last_persist: Instant,
}

impl BatchInner {
    fn index_of(&self, id: &str) -> Result<usize, BatchError> {
        self.state
            .tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| BatchError::TaskNotFound(id.to_string()))
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut TaskRecord, BatchError> {
        let idx = self.index_of(id)?;
        Ok(&mut self.state.tasks[idx])
    }

    fn state_event(&self, idx: usize) -> BatchEvent {
        let task = &self.state.tasks[idx];
        BatchEvent::TaskState {
            task_id: task.id.clone(),
            state: task.state,
            message: task.message.clone(),
            saved_count: task.saved_count,
            retry_count: task.retry_count,
            global_progress: global_progress(&self.state.tasks),
        }
    }

    fn progress_event(&self, idx: usize) -> BatchEvent {
        let task = &self.state.tasks[idx];
        BatchEvent::TaskProgress {
            task_id: task.id.clone(),
            saved_count: task.saved_count,
            percent: task.progress,
            message: task.message.clone(),
            eta_seconds: task.eta_seconds,
            elapsed_seconds: task.elapsed_seconds,
            current_frame: task.last_frame,
            global_progress: global_progress(&self.state.tasks),
        }
    }

    fn running_count(&self) -> usize {
        self.state.tasks.iter().filter(|t| t.is_running()).count()
    }

    /// Applies `order` to the waiting tasks only. Waiting tasks keep the
    /// slots they occupy, so nothing else moves.
    fn reorder_waiting(&mut self, order: impl FnOnce(Vec<TaskRecord>) -> Vec<TaskRecord>) {
        let tasks = &mut self.state.tasks;
        let slots: Vec<usize> = (0..tasks.len()).filter(|&i| tasks[i].is_waiting()).collect();
        let waiting: Vec<TaskRecord> = slots.iter().map(|&i| tasks[i].clone()).collect();
        for (slot, task) in slots.into_iter().zip(order(waiting)) {
            tasks[slot] = task;
        }
    }
}

pub struct Batch {
    id: String,
    dir: PathBuf,
    services: BatchServices,
    inner: Mutex<BatchInner>,
    events: EventHub,
    status_tx: watch::Sender<RunStatus>,
    persist_lock: Mutex<()>,
}

impl Batch {
    /// Creates an empty batch in `root/batch_<id>`.
    pub fn create(
        root: &Path,
        params: ExtractParams,
        max_workers: usize,
        services: BatchServices,
    ) -> Result<Arc<Self>, BatchError> {
        let id = short_id();
        let dir = root.join(format!("batch_{}", id));
        fs::create_dir_all(&dir)?;
        let batch = Self::from_state(dir, Checkpoint::new(id, params, max_workers), services);
        batch.persist();
        tracing::info!("Batch {}: created at {}", batch.id, batch.dir.display());
        Ok(Arc::new(batch))
    }

    /// Reloads a batch from its checkpoint. Interrupted tasks become errors
    /// and processing is not resumed.
    pub fn open(dir: &Path, services: BatchServices) -> Result<Arc<Self>, BatchError> {
        let state = Checkpoint::read(dir)?.recover();
        let batch = Self::from_state(dir.to_path_buf(), state, services);
        batch.persist();
        tracing::info!(
            "Batch {}: recovered with {} tasks",
            batch.id,
            batch.lock().state.tasks.len()
        );
        Ok(Arc::new(batch))
    }

    fn from_state(dir: PathBuf, state: Checkpoint, services: BatchServices) -> Self {
        let (status_tx, _) = watch::channel(RunStatus::Idle);
        Self {
            id: state.id.clone(),
            dir,
            services,
            inner: Mutex::new(BatchInner {
                slots: WorkerSlots::new(state.max_workers),
                state,
                pause_requested: false,
                run_started: None,
                last_persist: Instant::now(),
            }),
            events: EventHub::default(),
            status_tx,
            persist_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BatchInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn services(&self) -> &BatchServices {
        &self.services
    }

    pub fn status(&self) -> RunStatus {
        self.lock().state.status
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let inner = self.lock();
        BatchSnapshot {
            state: inner.state.clone(),
            pausing: inner.pause_requested,
            global_progress: global_progress(&inner.state.tasks),
        }
    }

    pub fn task(&self, id: &str) -> Option<TaskRecord> {
        self.lock().state.tasks.iter().find(|t| t.id == id).cloned()
    }

    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.lock().state.tasks.clone()
    }

    pub fn archived(&self) -> Vec<ArchivedTask> {
        self.lock().state.archive.clone()
    }

    pub fn global_progress(&self) -> f64 {
        global_progress(&self.lock().state.tasks)
    }

    /// Event stream for one listener, opening with a full snapshot.
    pub fn listen(&self) -> impl Stream<Item = BatchEvent> + Send + 'static {
        let rx = self.events.subscribe();
        EventHub::listen(rx, self.snapshot())
    }

    /// Raw event feed without the opening snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    fn publish(&self, events: impl IntoIterator<Item = BatchEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    /// Writes the checkpoint. Failures are logged; memory stays authoritative.
    fn persist(&self) {
        let _writer = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let state = {
            let mut inner = self.lock();
            inner.last_persist = Instant::now();
            inner.state.clone()
        };
        if let Err(e) = state.write(&self.dir) {
            tracing::warn!("Batch {}: checkpoint write failed: {:#}", self.id, e);
        }
    }

    // ---- ingestion and queue editing ----

    /// Probes a video and adds it to the unselected zone. Unusable videos
    /// are rejected before a task exists.
    pub fn ingest(&self, entry: IngestEntry) -> Result<TaskRecord, BatchError> {
        let meta = self
            .services
            .probe
            .probe(&entry.path)
            .map_err(|e| BatchError::Rejected(format!("{}: {:#}", entry.path.display(), e)))?;

        let id = short_id();
        let display_name = entry.resolved_name();
        let output_dir = self.dir.join(sanitize_dirname(&display_name, &id[..4]));
        let task = TaskRecord::new(id, entry.path, display_name, meta, output_dir);
        task.paths().create()?;

        if let Err(e) = self
            .services
            .probe
            .thumbnail(&task.video_path, &task.paths().thumbnail())
        {
            tracing::warn!("Batch {}: no thumbnail for {}: {:#}", self.id, task.id, e);
        }

        self.lock().state.tasks.push(task.clone());
        tracing::info!(
            "Batch {}: added {} ({}, {} frames)",
            self.id,
            task.display_name,
            task.id,
            task.meta.total_frames
        );
        self.publish([BatchEvent::TaskAdded {
            task: Box::new(task.clone()),
        }]);
        self.persist();
        Ok(task)
    }

    /// Moves unselected tasks to the end of the queue, in the given order.
    /// Tasks already queued are left alone.
    pub fn enqueue(&self, ids: &[String]) -> Result<usize, BatchError> {
        let events = {
            let mut inner = self.lock();
            for id in ids {
                let idx = inner.index_of(id)?;
                let task = &inner.state.tasks[idx];
                if task.state == TaskState::Completed {
                    return Err(task.wrong_state("queue"));
                }
            }

            let mut moved = Vec::new();
            for id in ids {
                let idx = inner.index_of(id)?;
                if inner.state.tasks[idx].state != TaskState::Unselected {
                    continue;
                }
                let task = &mut inner.state.tasks[idx];
                task.transition(TaskState::WAITING, "queue")?;
                task.reset_progress();
                task.message = "Waiting".to_string();
                let task = inner.state.tasks.remove(idx);
                inner.state.tasks.push(task);
                moved.push(inner.state.tasks.len() - 1);
            }
            moved
                .into_iter()
                .map(|idx| inner.state_event(idx))
                .collect::<Vec<_>>()
        };
        let count = events.len();
        if count > 0 {
            self.publish(events);
            self.persist();
        }
        Ok(count)
    }

    /// Takes a waiting task back out of the queue and resets it.
    pub fn unselect(&self, id: &str) -> Result<(), BatchError> {
        let (paths, event) = {
            let mut inner = self.lock();
            let idx = inner.index_of(id)?;
            let task = &mut inner.state.tasks[idx];
            task.transition(TaskState::Unselected, "unselect")?;
            task.reset_progress();
            task.reset_output();
            let paths = task.paths();
            (paths, inner.state_event(idx))
        };
        paths.clear_images()?;
        self.publish([event]);
        self.persist();
        Ok(())
    }

    /// Reorders waiting tasks: listed ids first, the rest after in their
    /// previous order. Running and finished tasks are not moved.
    pub fn reorder(&self, ids: &[String]) {
        self.lock().reorder_waiting(|mut waiting| {
            let mut ordered = Vec::with_capacity(waiting.len());
            for id in ids {
                if let Some(pos) = waiting.iter().position(|t| &t.id == id) {
                    ordered.push(waiting.remove(pos));
                }
            }
            ordered.extend(waiting);
            ordered
        });
        self.persist();
    }

    /// Makes a waiting task the next one to start.
    pub fn prioritize(&self, id: &str) -> Result<(), BatchError> {
        {
            let mut inner = self.lock();
            let task = inner.task_mut(id)?;
            if !task.is_waiting() {
                return Err(task.wrong_state("prioritize"));
            }
            inner.reorder_waiting(|mut waiting| {
                if let Some(pos) = waiting.iter().position(|t| t.id == id) {
                    let task = waiting.remove(pos);
                    waiting.insert(0, task);
                }
                waiting
            });
        }
        self.persist();
        Ok(())
    }

    pub fn rename(&self, id: &str, name: &str) -> Result<(), BatchError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BatchError::InvalidName(name.to_string()));
        }
        self.lock().task_mut(id)?.display_name = name.to_string();
        self.publish([BatchEvent::TaskRenamed {
            task_id: id.to_string(),
            display_name: name.to_string(),
        }]);
        self.persist();
        Ok(())
    }

    // ---- run control ----

    pub fn set_params(&self, params: ExtractParams) -> Result<(), BatchError> {
        {
            let mut inner = self.lock();
            if inner.state.status == RunStatus::Processing {
                return Err(BatchError::BatchBusy("processing"));
            }
            inner.state.params = params;
        }
        self.persist();
        Ok(())
    }

    /// Changes the worker limit. The slot semaphore is rebuilt, not patched.
    pub fn set_max_workers(&self, max_workers: usize) -> Result<(), BatchError> {
        if max_workers == 0 {
            return Err(BatchError::Rejected("max_workers must be at least 1".into()));
        }
        {
            let mut inner = self.lock();
            inner.slots.retire();
            inner.slots = WorkerSlots::new(max_workers);
            inner.state.max_workers = max_workers;
        }
        tracing::info!("Batch {}: max_workers = {}", self.id, max_workers);
        self.persist();
        Ok(())
    }

    pub fn max_workers(&self) -> usize {
        self.lock().state.max_workers
    }

    /// Starts the dispatcher. Requires an idle batch with waiting tasks.
    pub fn start(self: &Arc<Self>) -> Result<(), BatchError> {
        {
            let mut inner = self.lock();
            if inner.state.status == RunStatus::Processing {
                return Err(BatchError::BatchBusy(if inner.pause_requested {
                    "pausing"
                } else {
                    "processing"
                }));
            }
            if !inner.state.tasks.iter().any(|t| t.is_waiting()) {
                return Err(BatchError::NothingQueued);
            }
            inner.state.status = RunStatus::Processing;
            inner.pause_requested = false;
            inner.state.counters.started_at = Some(Utc::now());
            inner.run_started = Some(Instant::now());
            for task in &mut inner.state.tasks {
                task.finished_this_run = false;
            }
            let max_workers = inner.state.max_workers;
            inner.slots.retire();
            inner.slots = WorkerSlots::new(max_workers);
        }
        self.status_tx.send_replace(RunStatus::Processing);
        self.publish([BatchEvent::BatchStatus {
            status: RunStatus::Processing,
            pausing: false,
        }]);
        self.persist();
        tracing::info!("Batch {}: processing started", self.id);

        tokio::spawn(dispatcher::run(self.clone()));
        Ok(())
    }

    /// Stops admitting tasks. Running tasks finish; then the batch goes idle.
    pub fn pause_after_current(&self) -> Result<(), BatchError> {
        {
            let mut inner = self.lock();
            if inner.state.status != RunStatus::Processing {
                return Err(BatchError::BatchBusy("idle"));
            }
            inner.pause_requested = true;
        }
        tracing::info!("Batch {}: pausing after current tasks", self.id);
        self.publish([BatchEvent::BatchStatus {
            status: RunStatus::Processing,
            pausing: true,
        }]);
        Ok(())
    }

    /// Resolves once the batch is idle.
    pub async fn wait_idle(&self) {
        let mut rx = self.status_tx.subscribe();
        let _ = rx.wait_for(|status| *status == RunStatus::Idle).await;
    }

    /// Cancels a waiting task at once, or asks a running one to stop.
    pub fn cancel(&self, id: &str) -> Result<Ack, BatchError> {
        let (ack, event) = {
            let mut inner = self.lock();
            let idx = inner.index_of(id)?;
            let task = &mut inner.state.tasks[idx];
            let ack = if task.is_waiting() {
                task.transition(TaskState::ERROR, "cancel")?;
                task.message = "Cancelled".to_string();
                task.error = Some("cancelled".to_string());
                Ack::Done
            } else if task.is_running() {
                task.cancel_intent = Some(CancelIntent::Stop);
                task.cancel.cancel();
                task.message = "Cancelling".to_string();
                Ack::InProgress
            } else {
                return Err(task.wrong_state("cancel"));
            };
            if ack == Ack::Done {
                inner.state.counters.failed_count += 1;
            }
            (ack, inner.state_event(idx))
        };
        self.publish([event]);
        if ack == Ack::Done {
            self.persist();
        }
        Ok(ack)
    }

    /// Puts a failed task back in the queue. With `resume`, extraction
    /// continues after the last processed frame and keeps existing images;
    /// otherwise the old output is discarded.
    pub fn retry(&self, id: &str, resume: bool) -> Result<(), BatchError> {
        let (discard, event) = {
            let mut inner = self.lock();
            let idx = inner.index_of(id)?;
            let task = &mut inner.state.tasks[idx];
            task.transition(TaskState::WAITING, "retry")?;
            let resumable = resume && task.last_frame > 0 && task.saved_count > 0;
            task.retry_count += 1;
            task.reset_progress();
            task.message = "Waiting".to_string();
            let discard = if resumable {
                task.resume_from = Some(task.last_frame);
                None
            } else {
                task.reset_output();
                Some(task.paths())
            };
            inner.state.counters.failed_count = inner.state.counters.failed_count.saturating_sub(1);
            (discard, inner.state_event(idx))
        };
        if let Some(paths) = discard {
            paths.clear_images()?;
        }
        self.publish([event]);
        self.persist();
        Ok(())
    }

    /// Retries every task in the error state from scratch.
    pub fn retry_all_failed(&self) -> usize {
        let failed: Vec<String> = self
            .lock()
            .state
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::ERROR)
            .map(|t| t.id.clone())
            .collect();
        failed
            .iter()
            .filter(|id| self.retry(id, false).is_ok())
            .count()
    }

    // ---- archive ----

    /// Soft-deletes a failed or completed task. A running task is cancelled
    /// and archived once its worker exits.
    pub fn archive(&self, id: &str) -> Result<Ack, BatchError> {
        let (ack, event, pending) = {
            let mut inner = self.lock();
            let idx = inner.index_of(id)?;
            let reason = match inner.state.tasks[idx].state {
                TaskState::RUNNING => None,
                TaskState::ERROR => Some(ArchiveReason::Failed),
                TaskState::Completed => Some(ArchiveReason::Completed),
                _ => return Err(inner.state.tasks[idx].wrong_state("archive")),
            };
            match reason {
                Some(reason) => {
                    let pending = self.archive_at(&mut inner, idx, reason);
                    let event = BatchEvent::TaskArchived {
                        task_id: id.to_string(),
                    };
                    (Ack::Done, event, Some(pending))
                }
                None => {
                    let task = &mut inner.state.tasks[idx];
                    task.cancel_intent = Some(CancelIntent::Archive);
                    task.cancel.cancel();
                    task.message = "Archiving".to_string();
                    (Ack::InProgress, inner.state_event(idx), None)
                }
            }
        };
        if let Some(pending) = pending {
            self.store_archived(pending);
        }
        self.publish([event]);
        if ack == Ack::Done {
            self.persist();
        }
        Ok(ack)
    }

    /// Removes the task at `idx` into the archive. Its files are moved by
    /// `store_archived` once the lock is released.
    fn archive_at(&self, inner: &mut BatchInner, idx: usize, reason: ArchiveReason) -> PendingMove {
        let task = inner.state.tasks.remove(idx);
        let counters = &mut inner.state.counters;
        match task.state {
            TaskState::Completed => {
                counters.completed_count = counters.completed_count.saturating_sub(1);
                counters.total_images = counters.total_images.saturating_sub(task.saved_count);
            }
            TaskState::ERROR => {
                counters.failed_count = counters.failed_count.saturating_sub(1);
            }
            _ => {}
        }

        let dir_name = task
            .output_dir
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| task.id.clone().into());
        let pending = PendingMove {
            task_id: task.id.clone(),
            from: task.output_dir.clone(),
            to: self.dir.join(ARCHIVE_DIR).join(dir_name),
        };
        tracing::info!("Batch {}: archived {} ({:?})", self.id, task.id, reason);
        inner.state.archive.push(ArchivedTask {
            task,
            reason,
            archived_at: Utc::now(),
            stored_at: pending.to.clone(),
        });
        pending
    }

    /// Moves an archived task's files aside. On failure they stay where they
    /// are and the archive entry points there instead.
    fn store_archived(&self, pending: PendingMove) {
        let Err(e) = move_dir(&pending.from, &pending.to) else {
            return;
        };
        tracing::warn!(
            "Batch {}: could not move {} to the archive: {}",
            self.id,
            pending.from.display(),
            e
        );
        let mut inner = self.lock();
        if let Some(entry) = inner
            .state
            .archive
            .iter_mut()
            .find(|a| a.task.id == pending.task_id)
        {
            entry.stored_at = pending.from;
        }
    }

    /// Brings an archived task back. A resume without a usable breakpoint
    /// starts over like a requeue.
    pub fn restore(&self, id: &str, mode: RestoreMode) -> Result<TaskRecord, BatchError> {
        let archived = {
            let mut inner = self.lock();
            let pos = inner
                .state
                .archive
                .iter()
                .position(|a| a.task.id == id)
                .ok_or_else(|| BatchError::ArchiveNotFound(id.to_string()))?;
            inner.state.archive.remove(pos)
        };
        let task = match self.unpack_archived(&archived, mode) {
            Ok(task) => task,
            Err(e) => {
                let mut archived = archived;
                if !archived.stored_at.exists() {
                    archived.stored_at = archived.task.output_dir.clone();
                }
                self.lock().state.archive.push(archived);
                return Err(e);
            }
        };

        {
            let mut inner = self.lock();
            if task.state == TaskState::Completed {
                inner.state.counters.completed_count += 1;
                inner.state.counters.total_images += task.saved_count;
            }
            inner.state.tasks.push(task.clone());
        }
        tracing::info!("Batch {}: restored {} as {}", self.id, task.id, task.state);
        self.publish([BatchEvent::TaskAdded {
            task: Box::new(task.clone()),
        }]);
        self.persist();
        Ok(task)
    }

    /// Puts an archived task's files back and prepares its record for `mode`.
    /// Runs without the batch lock.
    fn unpack_archived(
        &self,
        archived: &ArchivedTask,
        mode: RestoreMode,
    ) -> Result<TaskRecord, BatchError> {
        move_dir(&archived.stored_at, &archived.task.output_dir)?;
        let mut task = archived.task.clone();
        let paths = task.paths();
        paths.create()?;
        task.reset_progress();
        task.saved_count = count_images(&paths.images());

        let resumable = task.last_frame > 0 && task.saved_count > 0;
        match mode {
            RestoreMode::Resume if resumable => {
                task.resume_from = Some(task.last_frame);
                task.state = TaskState::WAITING;
                task.message = "Waiting".to_string();
            }
            RestoreMode::Requeue | RestoreMode::Resume => {
                paths.clear_images()?;
                task.reset_output();
                task.state = TaskState::WAITING;
                task.message = "Waiting".to_string();
            }
            RestoreMode::Completed => {
                task.state = TaskState::Completed;
                task.progress = 100;
                task.message = format!("Done: {} images", task.saved_count);
            }
        }
        Ok(task)
    }

    /// Removes an archived task and its files for good.
    pub fn delete_archived(&self, id: &str) -> Result<(), BatchError> {
        let archived = {
            let mut inner = self.lock();
            let pos = inner
                .state
                .archive
                .iter()
                .position(|a| a.task.id == id)
                .ok_or_else(|| BatchError::ArchiveNotFound(id.to_string()))?;
            inner.state.archive.remove(pos)
        };
        if archived.stored_at.exists() {
            fs::remove_dir_all(&archived.stored_at)?;
        }
        self.publish([BatchEvent::TaskDeleted {
            task_id: id.to_string(),
        }]);
        self.persist();
        Ok(())
    }

    // ---- images and packaging ----

    fn idle_task(&self, id: &str, action: &'static str) -> Result<TaskRecord, BatchError> {
        let inner = self.lock();
        let task = &inner.state.tasks[inner.index_of(id)?];
        if task.is_running() {
            return Err(task.wrong_state(action));
        }
        Ok(task.clone())
    }

    fn recount(&self, id: &str) -> Result<usize, BatchError> {
        let count = {
            let mut inner = self.lock();
            let task = inner.task_mut(id)?;
            task.saved_count = count_images(&task.paths().images());
            task.saved_count
        };
        self.persist();
        Ok(count)
    }

    pub fn images(&self, id: &str) -> Result<Vec<String>, BatchError> {
        let task = self.task(id).ok_or_else(|| BatchError::TaskNotFound(id.to_string()))?;
        Ok(list_images(&task.paths().images()))
    }

    pub fn trashed_images(&self, id: &str) -> Result<Vec<String>, BatchError> {
        let task = self.task(id).ok_or_else(|| BatchError::TaskNotFound(id.to_string()))?;
        Ok(list_images(&task.paths().trash()))
    }

    /// Moves one image into the task's trash. Returns the new image count.
    pub fn trash_image(&self, id: &str, file_name: &str) -> Result<usize, BatchError> {
        let task = self.idle_task(id, "delete images")?;
        let paths = task.paths();
        move_image(&paths.images(), &paths.trash(), file_name)?;
        self.recount(id)
    }

    pub fn restore_image(&self, id: &str, file_name: &str) -> Result<usize, BatchError> {
        let task = self.idle_task(id, "restore images")?;
        let paths = task.paths();
        move_image(&paths.trash(), &paths.images(), file_name)?;
        self.recount(id)
    }

    /// Restores every trashed image. Returns how many came back.
    pub fn restore_all_images(&self, id: &str) -> Result<usize, BatchError> {
        let task = self.idle_task(id, "restore images")?;
        let paths = task.paths();
        let mut restored = 0;
        for name in list_images(&paths.trash()) {
            match move_image(&paths.trash(), &paths.images(), &name) {
                Ok(()) => restored += 1,
                Err(e) => tracing::warn!("Batch {}: cannot restore {}: {}", self.id, name, e),
            }
        }
        self.recount(id)?;
        Ok(restored)
    }

    /// Packages a completed task's images through `packager`.
    pub fn package(
        &self,
        id: &str,
        format: &str,
        packager: &dyn Packager,
    ) -> Result<String, BatchError> {
        let task = self.task(id).ok_or_else(|| BatchError::TaskNotFound(id.to_string()))?;
        if task.state != TaskState::Completed {
            return Err(task.wrong_state("package"));
        }
        let paths = task.paths();
        let images: Vec<PathBuf> = list_images(&paths.images())
            .into_iter()
            .map(|name| paths.images().join(name))
            .collect();

        match packager.package(&images, &paths.packages(), format, &task.display_name) {
            Ok(name) => {
                self.publish([BatchEvent::PackagingDone {
                    task_id: task.id.clone(),
                    name: name.clone(),
                    format: format.to_string(),
                }]);
                Ok(name)
            }
            Err(e) => {
                tracing::warn!("Batch {}: packaging {} failed: {}", self.id, task.id, e);
                self.publish([BatchEvent::PackagingError {
                    task_id: task.id.clone(),
                    message: e.to_string(),
                }]);
                Err(e.into())
            }
        }
    }

    /// Stops admitting work, cancels running tasks and ends every listener.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.pause_requested = true;
            for task in inner.state.tasks.iter_mut().filter(|t| t.is_running()) {
                task.cancel_intent = Some(CancelIntent::Stop);
                task.cancel.cancel();
            }
        }
        self.publish([BatchEvent::Closed]);
    }

    // ---- dispatcher side ----

    pub(crate) fn pause_requested(&self) -> bool {
        self.lock().pause_requested
    }

    pub(crate) fn slots(&self) -> WorkerSlots {
        self.lock().slots.clone()
    }

    pub(crate) fn running_count(&self) -> usize {
        self.lock().running_count()
    }

    pub(crate) fn next_waiting(&self) -> Option<String> {
        self.lock()
            .state
            .tasks
            .iter()
            .find(|t| t.is_waiting())
            .map(|t| t.id.clone())
    }

    /// Fails a waiting task that cannot be admitted for lack of disk space.
    pub(crate) fn reject_for_space(&self, id: &str, free_mb: u64) {
        let event = {
            let mut inner = self.lock();
            let Ok(idx) = inner.index_of(id) else {
                return;
            };
            let task = &mut inner.state.tasks[idx];
            if task.transition(TaskState::ERROR, "start").is_err() {
                return;
            }
            task.error = Some(format!("insufficient disk space: {} MB free", free_mb));
            task.message = "Skipped: disk almost full".to_string();
            inner.state.counters.failed_count += 1;
            inner.state_event(idx)
        };
        tracing::warn!(
            "Batch {}: skipped {}, only {} MB free",
            self.id,
            id,
            free_mb
        );
        self.publish([event, BatchEvent::DiskWarning { free_mb }]);
        self.persist();
    }

    /// Marks a waiting task running and hands out its job. `None` if the
    /// task changed state since it was picked.
    pub(crate) fn claim(&self, id: &str) -> Option<Claim> {
        let (mut claim, resume_from, paths, event) = {
            let mut inner = self.lock();
            let idx = inner.index_of(id).ok()?;
            let params = inner.state.params.clone();
            let task = &mut inner.state.tasks[idx];
            task.transition(TaskState::RUNNING, "start").ok()?;
            task.reset_progress();
            task.message = "Starting".to_string();

            let resume_from = task.resume_from.take();
            let mut job = ExtractJob::new(task.video_path.clone(), task.paths().images(), params);
            if !task.meta.codec.is_empty() {
                job = job.with_codec(task.meta.codec.clone());
            }
            let claim = Claim {
                id: task.id.clone(),
                job,
                cancel: task.cancel.clone(),
                needs_probe: task.meta.total_frames == 0,
            };
            (claim, resume_from, task.paths(), inner.state_event(idx))
        };
        // The task is running now, so nothing else touches its images.
        claim.job.resume = resume_from.map(|start_frame| ResumePoint {
            start_frame,
            next_index: paths.next_image_index(),
            saved_base: count_images(&paths.images()),
            reference_image: paths.latest_image(),
        });
        tracing::info!("Batch {}: starting {}", self.id, id);
        self.publish([event]);
        self.persist();
        Some(claim)
    }

    /// Records metadata found by a late probe. Set once, never overwritten.
    pub(crate) fn record_metadata(&self, id: &str, meta: VideoMetadata) {
        if let Ok(task) = self.lock().task_mut(id) {
            if task.meta.total_frames == 0 {
                task.meta = meta;
            }
        }
    }

    pub(crate) fn record_progress(&self, id: &str, progress: &Progress) {
        let (event, due) = {
            let mut inner = self.lock();
            let Ok(idx) = inner.index_of(id) else {
                return;
            };
            let task = &mut inner.state.tasks[idx];
            if !task.is_running() {
                return;
            }
            task.saved_count = task.saved_count.max(progress.saved_count);
            task.progress = progress.percent;
            task.eta_seconds = progress.eta_seconds;
            task.elapsed_seconds = progress.elapsed_seconds;
            task.last_frame = progress.current_frame;
            if task.cancel_intent.is_none() {
                task.message = progress.message.clone();
            }
            let event = inner.progress_event(idx);
            (event, inner.last_persist.elapsed() >= CHECKPOINT_INTERVAL)
        };
        self.publish([event]);
        if due {
            self.persist();
        }
    }

    /// Applies a worker's outcome to its task.
    pub(crate) fn complete(&self, id: &str, outcome: ExtractOutcome) {
        let (event, pending) = {
            let mut inner = self.lock();
            let Ok(idx) = inner.index_of(id) else {
                tracing::warn!("Batch {}: finished task {} is gone", self.id, id);
                return;
            };
            let task = &mut inner.state.tasks[idx];
            let intent = task.cancel_intent.take();
            task.cancel.reset();
            task.finished_this_run = true;
            task.eta_seconds = None;

            let (next, reason) = match outcome {
                ExtractOutcome::Done(report) => {
                    task.saved_count = report.saved_count;
                    task.last_frame = report.last_frame;
                    task.progress = 100;
                    task.elapsed_seconds = report.elapsed.as_secs_f64();
                    task.message = format!("Done: {} images", report.saved_count);
                    task.error = None;
                    (TaskState::Completed, ArchiveReason::Completed)
                }
                ExtractOutcome::Cancelled {
                    saved_count,
                    last_frame,
                } => {
                    task.saved_count = task.saved_count.max(saved_count);
                    task.last_frame = last_frame;
                    task.message = "Cancelled".to_string();
                    task.error = Some("cancelled".to_string());
                    (TaskState::ERROR, ArchiveReason::HalfProcessed)
                }
                ExtractOutcome::Failed {
                    failure,
                    saved_count,
                    last_frame,
                } => {
                    tracing::warn!("Batch {}: task {} failed: {}", self.id, id, failure);
                    task.saved_count = task.saved_count.max(saved_count);
                    task.last_frame = last_frame;
                    task.message = format!("Failed: {}", failure.kind);
                    task.error = Some(failure.to_string());
                    (TaskState::ERROR, ArchiveReason::Failed)
                }
            };
            if let Err(e) = task.transition(next, "finish") {
                tracing::error!("Batch {}: {}", self.id, e);
            }
            let (saved, state) = (task.saved_count, task.state);

            let counters = &mut inner.state.counters;
            if state == TaskState::Completed {
                counters.completed_count += 1;
                counters.total_images += saved;
            } else {
                counters.failed_count += 1;
            }

            if intent == Some(CancelIntent::Archive) {
                let pending = self.archive_at(&mut inner, idx, reason);
                let event = BatchEvent::TaskArchived {
                    task_id: id.to_string(),
                };
                (event, Some(pending))
            } else {
                (inner.state_event(idx), None)
            }
        };
        if let Some(pending) = pending {
            self.store_archived(pending);
        }
        self.publish([event]);
        self.persist();
    }

    /// Called by the dispatcher once its last worker has exited.
    pub(crate) fn finish_run(&self) {
        let (counters, elapsed) = {
            let mut inner = self.lock();
            inner.state.status = RunStatus::Idle;
            inner.pause_requested = false;
            let elapsed = inner
                .run_started
                .take()
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0);
            (inner.state.counters.clone(), elapsed)
        };
        self.persist();
        tracing::info!(
            "Batch {}: idle, {} done, {} failed, {} images in {:.1}s",
            self.id,
            counters.completed_count,
            counters.failed_count,
            counters.total_images,
            elapsed
        );
        self.publish([
            BatchEvent::BatchStatus {
                status: RunStatus::Idle,
                pausing: false,
            },
            BatchEvent::BatchDone {
                completed_count: counters.completed_count,
                failed_count: counters.failed_count,
                total_images: counters.total_images,
                elapsed_seconds: (elapsed * 10.0).round() / 10.0,
            },
        ]);
        self.status_tx.send_replace(RunStatus::Idle);
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Moves a directory, creating the destination's parent. A missing source
/// or identical paths are a no-op.
fn move_dir(from: &Path, to: &Path) -> io::Result<()> {
    if from == to || !from.exists() {
        return Ok(());
    }
    if to.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", to.display()),
        ));
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to)
}

fn move_image(from_dir: &Path, to_dir: &Path, file_name: &str) -> Result<(), BatchError> {
    let name = safe_file_name(file_name)
        .ok_or_else(|| BatchError::Rejected(format!("bad image name: {}", file_name)))?;
    let src = from_dir.join(name);
    if !src.is_file() {
        return Err(BatchError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} not found", src.display()),
        )));
    }
    let dst = to_dir.join(name);
    if dst.exists() {
        return Err(BatchError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", dst.display()),
        )));
    }
    fs::create_dir_all(to_dir)?;
    fs::rename(&src, &dst)?;
    Ok(())
}

/// Batch completion in percent.
///
/// Counts queued tasks plus those finished during the current run. Finished
/// and failed tasks count as 100, running ones with their live percentage.
/// Weighted by frame count when every task has one.
pub fn global_progress(tasks: &[TaskRecord]) -> f64 {
    let members: Vec<&TaskRecord> = tasks
        .iter()
        .filter(|t| t.state.in_queue() || t.finished_this_run)
        .collect();
    if members.is_empty() {
        return 0.0;
    }
    let percent = |t: &TaskRecord| match t.state {
        TaskState::Completed | TaskState::ERROR => 100.0,
        TaskState::RUNNING => t.progress as f64,
        _ => 0.0,
    };
    let value = if members.iter().all(|t| t.meta.total_frames > 0) {
        let total: f64 = members.iter().map(|t| t.meta.total_frames as f64).sum();
        members
            .iter()
            .map(|t| t.meta.total_frames as f64 * percent(t))
            .sum::<f64>()
            / total
    } else {
        members.iter().map(|t| percent(t)).sum::<f64>() / members.len() as f64
    };
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::testing::*;
    use crate::extract::engine::image_file_name;
    use crate::package::DirectoryPackager;
    use std::time::Duration;

    fn ids(tasks: &[TaskRecord]) -> Vec<String> {
        tasks.iter().map(|t| t.id.clone()).collect()
    }

    #[test]
    fn test_global_progress_weighting() {
        let mut a = task_with_frames("a", 900);
        let mut b = task_with_frames("b", 100);
        a.state = TaskState::RUNNING;
        a.progress = 50;
        b.state = TaskState::WAITING;
        assert_eq!(global_progress(&[a.clone(), b.clone()]), 45.0);

        b.meta.total_frames = 0;
        assert_eq!(global_progress(&[a.clone(), b.clone()]), 25.0);

        let mut c = task_with_frames("c", 100);
        c.state = TaskState::Completed;
        assert_eq!(global_progress(&[a.clone(), c.clone()]), 50.0);
        c.finished_this_run = true;
        a.meta.total_frames = 100;
        assert_eq!(global_progress(&[a, c]), 75.0);
        assert_eq!(global_progress(&[]), 0.0);
    }

    #[tokio::test]
    async fn test_ingest_reads_metadata_and_rejects() {
        let env = TestEnv::new("ingest", FakeExtractor::new(5));
        let task = env.batch.ingest(IngestEntry::new("lectures/第1讲.mp4")).unwrap();
        assert_eq!(task.state, TaskState::Unselected);
        assert_eq!(task.display_name, "第1讲");
        assert_eq!(task.meta.total_frames, 900);
        assert!(task.paths().images().is_dir());
        assert!(task.paths().thumbnail().is_file());

        let err = env
            .batch
            .ingest(IngestEntry::new("broken.mp4"))
            .unwrap_err();
        assert!(matches!(err, BatchError::Rejected(_)));
        assert_eq!(env.batch.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let env = TestEnv::new("enqueue", FakeExtractor::new(5));
        let tasks = env.ingest_many(2);
        let all = ids(&tasks);

        assert_eq!(env.batch.enqueue(&all).unwrap(), 2);
        assert_eq!(env.batch.enqueue(&all).unwrap(), 0);
        let queued = env.batch.tasks();
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().all(|t| t.is_waiting()));

        env.batch.unselect(&all[0]).unwrap();
        assert_eq!(env.batch.task(&all[0]).unwrap().state, TaskState::Unselected);
        assert!(env.batch.unselect(&all[0]).is_err());
    }

    #[tokio::test]
    async fn test_reorder_and_prioritize_touch_waiting_only() {
        let env = TestEnv::new("reorder", FakeExtractor::new(5));
        let tasks = env.ingest_many(3);
        let all = ids(&tasks);
        env.batch.enqueue(&all).unwrap();

        env.batch.reorder(&[all[2].clone(), all[0].clone()]);
        assert_eq!(ids(&env.batch.tasks()), vec![all[2].clone(), all[0].clone(), all[1].clone()]);

        env.batch.prioritize(&all[1]).unwrap();
        assert_eq!(env.batch.next_waiting(), Some(all[1].clone()));

        env.batch.unselect(&all[0]).unwrap();
        assert!(matches!(
            env.batch.prioritize(&all[0]),
            Err(BatchError::WrongState { .. })
        ));
        assert!(matches!(env.batch.rename(&all[1], "  "), Err(BatchError::InvalidName(_))));
        env.batch.rename(&all[1], "线性代数 第2讲").unwrap();
        assert_eq!(env.batch.task(&all[1]).unwrap().display_name, "线性代数 第2讲");
    }

    #[tokio::test]
    async fn test_start_requires_waiting_tasks() {
        let env = TestEnv::new("start-empty", FakeExtractor::new(5));
        assert!(matches!(env.batch.start(), Err(BatchError::NothingQueued)));
        assert!(matches!(
            env.batch.pause_after_current(),
            Err(BatchError::BatchBusy("idle"))
        ));
    }

    #[tokio::test]
    async fn test_batch_runs_to_completion() {
        let env = TestEnv::new("complete", FakeExtractor::new(4));
        let tasks = env.ingest_many(3);
        env.batch.enqueue(&ids(&tasks)).unwrap();
        let events = env.record_events();

        env.batch.start().unwrap();
        assert!(matches!(env.batch.start(), Err(BatchError::BatchBusy(_))));
        env.wait_idle().await;

        let snapshot = env.batch.snapshot();
        assert_eq!(snapshot.state.status, RunStatus::Idle);
        assert!(snapshot.state.tasks.iter().all(|t| t.state == TaskState::Completed));
        assert!(snapshot.state.tasks.iter().all(|t| t.saved_count == 4));
        assert_eq!(snapshot.state.counters.completed_count, 3);
        assert_eq!(snapshot.state.counters.total_images, 12);
        assert_eq!(snapshot.global_progress, 100.0);

        let events = events.finish();
        assert!(events.iter().any(|e| matches!(
            e,
            BatchEvent::BatchDone { completed_count: 3, .. }
        )));
        let checkpoint = Checkpoint::read(env.batch.dir()).unwrap();
        assert!(checkpoint.tasks.iter().all(|t| t.state == TaskState::Completed));
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_max_workers() {
        let extractor = FakeExtractor::new(6);
        let env = TestEnv::new("bound", extractor.clone());
        env.batch.set_max_workers(2).unwrap();
        let tasks = env.ingest_many(5);
        env.batch.enqueue(&ids(&tasks)).unwrap();

        env.batch.start().unwrap();
        // Shrinking mid-run rebuilds the slots without leaking permits.
        tokio::time::sleep(Duration::from_millis(30)).await;
        env.batch.set_max_workers(1).unwrap();
        env.wait_idle().await;

        assert!(extractor.max_concurrent() <= 2);
        assert!(env.batch.tasks().iter().all(|t| t.state == TaskState::Completed));
    }

    #[tokio::test]
    async fn test_single_worker_runs_tasks_in_order() {
        let env = TestEnv::new("serial", FakeExtractor::new(3));
        env.batch.set_max_workers(1).unwrap();
        let first = env.ingest_named("same.mp4");
        let second = env.ingest_named("same.mp4");
        env.batch.enqueue(&[first.id.clone(), second.id.clone()]).unwrap();
        let events = env.record_events();

        env.batch.start().unwrap();
        env.wait_idle().await;

        let transitions: Vec<(String, TaskState)> = events
            .finish()
            .into_iter()
            .filter_map(|e| match e {
                BatchEvent::TaskState { task_id, state, .. } => Some((task_id, state)),
                _ => None,
            })
            .collect();
        let pos = |id: &str, state: TaskState| {
            transitions
                .iter()
                .position(|(t, s)| t == id && *s == state)
                .unwrap()
        };
        assert!(pos(&second.id, TaskState::RUNNING) > pos(&first.id, TaskState::Completed));
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_retriable() {
        let extractor = FakeExtractor::new(3).failing_on("bad");
        let env = TestEnv::new("failure", extractor);
        let good = env.ingest_named("good.mp4");
        let bad = env.ingest_named("bad.mp4");
        env.batch.enqueue(&[bad.id.clone(), good.id.clone()]).unwrap();

        env.batch.start().unwrap();
        env.wait_idle().await;

        let failed = env.batch.task(&bad.id).unwrap();
        assert_eq!(failed.state, TaskState::ERROR);
        assert!(failed.error.as_deref().unwrap_or("").contains("decode"));
        assert_eq!(env.batch.task(&good.id).unwrap().state, TaskState::Completed);
        assert_eq!(env.batch.snapshot().state.counters.failed_count, 1);

        assert_eq!(env.batch.retry_all_failed(), 1);
        let retried = env.batch.task(&bad.id).unwrap();
        assert!(retried.is_waiting());
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.error, None);
        assert!(matches!(
            env.batch.retry(&good.id, false),
            Err(BatchError::WrongState { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_then_resume_keeps_images() {
        let extractor = FakeExtractor::new(40);
        let env = TestEnv::new("cancel", extractor.clone());
        let task = env.ingest_named("long.mp4");
        env.batch.enqueue(&[task.id.clone()]).unwrap();

        env.batch.start().unwrap();
        env.wait_for_saved(&task.id, 5).await;
        assert_eq!(env.batch.cancel(&task.id).unwrap(), Ack::InProgress);
        env.wait_idle().await;

        let cancelled = env.batch.task(&task.id).unwrap();
        assert_eq!(cancelled.state, TaskState::ERROR);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled"));
        let before = cancelled.saved_count;
        assert!(before >= 5);

        env.batch.retry(&task.id, true).unwrap();
        assert_eq!(env.batch.task(&task.id).unwrap().saved_count, before);
        env.batch.start().unwrap();
        env.wait_idle().await;

        let done = env.batch.task(&task.id).unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert!(done.saved_count >= before);
        let resume = extractor.last_resume().unwrap();
        assert_eq!(resume.saved_base, before);
        assert_eq!(resume.next_index, before);
        assert!(resume.reference_image.is_some());
    }

    #[tokio::test]
    async fn test_cancel_waiting_is_immediate() {
        let env = TestEnv::new("cancel-waiting", FakeExtractor::new(3));
        let task = env.ingest_named("a.mp4");
        env.batch.enqueue(&[task.id.clone()]).unwrap();
        assert_eq!(env.batch.cancel(&task.id).unwrap(), Ack::Done);
        assert_eq!(env.batch.task(&task.id).unwrap().state, TaskState::ERROR);
        assert!(env.batch.cancel(&task.id).is_err());
    }

    #[tokio::test]
    async fn test_resumed_retry_counts_images_after_trash() {
        let extractor = FakeExtractor::new(40);
        let env = TestEnv::new("trash-resume", extractor.clone());
        let task = env.ingest_named("long.mp4");
        env.batch.enqueue(&[task.id.clone()]).unwrap();
        env.batch.start().unwrap();
        env.wait_for_saved(&task.id, 5).await;
        env.batch.cancel(&task.id).unwrap();
        env.wait_idle().await;

        let before = env.batch.task(&task.id).unwrap().saved_count;
        assert_eq!(env.batch.trash_image(&task.id, "slide_0001.jpg").unwrap(), before - 1);
        env.batch.retry(&task.id, true).unwrap();
        env.batch.start().unwrap();
        env.wait_idle().await;

        let resume = extractor.last_resume().unwrap();
        assert_eq!(resume.saved_base, before - 1);
        assert_eq!(resume.next_index, before);
        let done = env.batch.task(&task.id).unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.saved_count, env.batch.images(&task.id).unwrap().len());
        assert_eq!(env.batch.snapshot().state.counters.total_images, done.saved_count);

        // The trashed index was never handed out again.
        assert!(!env.batch.images(&task.id).unwrap().contains(&"slide_0001.jpg".to_string()));
        assert_eq!(env.batch.restore_image(&task.id, "slide_0001.jpg").unwrap(), done.saved_count + 1);
    }

    #[tokio::test]
    async fn test_fresh_retry_discards_trash() {
        let env = TestEnv::new("trash-fresh", FakeExtractor::new(40));
        let task = env.ingest_named("long.mp4");
        env.batch.enqueue(&[task.id.clone()]).unwrap();
        env.batch.start().unwrap();
        env.wait_for_saved(&task.id, 3).await;
        env.batch.cancel(&task.id).unwrap();
        env.wait_idle().await;

        env.batch.trash_image(&task.id, "slide_0000.jpg").unwrap();
        env.batch.retry(&task.id, false).unwrap();
        assert!(env.batch.trashed_images(&task.id).unwrap().is_empty());
        env.batch.start().unwrap();
        env.wait_idle().await;

        let done = env.batch.task(&task.id).unwrap();
        assert_eq!(done.saved_count, 40);
        assert!(env.batch.restore_image(&task.id, "slide_0000.jpg").is_err());

        // A trashed file never replaces a live image of the same name.
        let paths = task.paths();
        fs::create_dir_all(paths.trash()).unwrap();
        fs::write(paths.trash().join("slide_0002.jpg"), b"old").unwrap();
        assert!(env.batch.restore_image(&task.id, "slide_0002.jpg").is_err());
        assert_eq!(fs::read(paths.images().join("slide_0002.jpg")).unwrap(), b"jpg");
        assert_eq!(env.batch.restore_all_images(&task.id).unwrap(), 0);
        assert_eq!(env.batch.task(&task.id).unwrap().saved_count, 40);
    }

    #[tokio::test]
    async fn test_restore_resume_without_breakpoint_starts_over() {
        let env = TestEnv::new("restore-fresh", FakeExtractor::new(2));
        let task = env.ingest_named("a.mp4");
        env.batch.enqueue(&[task.id.clone()]).unwrap();
        env.batch.cancel(&task.id).unwrap();

        // Leftovers from some earlier run, with no frame to resume from.
        let images = task.paths().images();
        fs::create_dir_all(&images).unwrap();
        for i in 0..5 {
            fs::write(images.join(image_file_name(i)), b"stale").unwrap();
        }
        env.batch.archive(&task.id).unwrap();

        let restored = env.batch.restore(&task.id, RestoreMode::Resume).unwrap();
        assert!(restored.is_waiting());
        assert_eq!(restored.resume_from, None);
        assert_eq!(restored.saved_count, 0);
        assert!(env.batch.images(&task.id).unwrap().is_empty());

        env.batch.start().unwrap();
        env.wait_idle().await;
        assert_eq!(
            env.batch.images(&task.id).unwrap(),
            vec!["slide_0000.jpg", "slide_0001.jpg"]
        );
        assert_eq!(env.batch.task(&task.id).unwrap().saved_count, 2);
    }

    #[tokio::test]
    async fn test_claim_passes_detected_codec() {
        let env = TestEnv::new("codec", FakeExtractor::new(1));
        let task = env.ingest_named("a.mp4");
        env.batch.enqueue(&[task.id.clone()]).unwrap();
        let claim = env.batch.claim(&task.id).unwrap();
        assert_eq!(claim.job.codec.as_deref(), Some("h264"));
        assert_eq!(claim.job.resume, None);
    }

    #[tokio::test]
    async fn test_archive_running_then_restore_resume() {
        let env = TestEnv::new("archive-running", FakeExtractor::new(40));
        let task = env.ingest_named("lecture.mp4");
        env.batch.enqueue(&[task.id.clone()]).unwrap();

        env.batch.start().unwrap();
        env.wait_for_saved(&task.id, 4).await;
        assert_eq!(env.batch.archive(&task.id).unwrap(), Ack::InProgress);
        env.wait_idle().await;

        assert!(env.batch.task(&task.id).is_none());
        let archived = env.batch.archived();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].reason, ArchiveReason::HalfProcessed);
        assert!(archived[0].stored_at.is_dir());
        let before = archived[0].task.saved_count;

        let restored = env.batch.restore(&task.id, RestoreMode::Resume).unwrap();
        assert!(restored.is_waiting());
        assert_eq!(restored.saved_count, before);
        assert!(restored.resume_from.is_some());

        env.batch.start().unwrap();
        env.wait_idle().await;
        let done = env.batch.task(&task.id).unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert!(done.saved_count >= before);
    }

    #[tokio::test]
    async fn test_archive_restore_and_delete_completed() {
        let env = TestEnv::new("archive-done", FakeExtractor::new(3));
        let task = env.ingest_named("a.mp4");
        env.batch.enqueue(&[task.id.clone()]).unwrap();
        assert!(matches!(
            env.batch.archive(&task.id),
            Err(BatchError::WrongState { .. })
        ));
        env.batch.start().unwrap();
        env.wait_idle().await;

        assert_eq!(env.batch.archive(&task.id).unwrap(), Ack::Done);
        assert!(!task.output_dir.exists());
        assert_eq!(env.batch.snapshot().state.counters.completed_count, 0);

        let restored = env.batch.restore(&task.id, RestoreMode::Completed).unwrap();
        assert_eq!(restored.state, TaskState::Completed);
        assert_eq!(restored.saved_count, 3);
        assert!(task.output_dir.is_dir());
        assert_eq!(env.batch.snapshot().state.counters.total_images, 3);

        env.batch.archive(&task.id).unwrap();
        let stored_at = env.batch.archived()[0].stored_at.clone();
        env.batch.delete_archived(&task.id).unwrap();
        assert!(!stored_at.exists());
        assert!(env.batch.archived().is_empty());
        assert!(matches!(
            env.batch.restore(&task.id, RestoreMode::Requeue),
            Err(BatchError::ArchiveNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_low_disk_fails_task_without_stopping_batch() {
        let env = TestEnv::with_space("disk", FakeExtractor::new(3), Some(10 * 1024 * 1024));
        let tasks = env.ingest_many(2);
        env.batch.enqueue(&ids(&tasks)).unwrap();
        let events = env.record_events();

        env.batch.start().unwrap();
        env.wait_idle().await;

        for task in env.batch.tasks() {
            assert_eq!(task.state, TaskState::ERROR);
            assert!(task.error.unwrap().contains("disk space"));
        }
        let events = events.finish();
        assert!(events.iter().any(|e| matches!(e, BatchEvent::DiskWarning { free_mb: 10 })));
        assert!(events.iter().any(|e| matches!(e, BatchEvent::BatchDone { .. })));
    }

    #[tokio::test]
    async fn test_pause_after_current_lets_running_finish() {
        let env = TestEnv::new("pause", FakeExtractor::new(20));
        env.batch.set_max_workers(1).unwrap();
        let tasks = env.ingest_many(3);
        env.batch.enqueue(&ids(&tasks)).unwrap();

        env.batch.start().unwrap();
        env.wait_for_saved(&tasks[0].id, 1).await;
        env.batch.pause_after_current().unwrap();
        env.wait_idle().await;

        let states: Vec<TaskState> = env.batch.tasks().iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![TaskState::Completed, TaskState::WAITING, TaskState::WAITING]
        );
        assert!(!env.batch.snapshot().pausing);
        env.batch.start().unwrap();
        env.wait_idle().await;
        assert!(env.batch.tasks().iter().all(|t| t.state == TaskState::Completed));
    }

    #[tokio::test]
    async fn test_reopen_after_crash() {
        let env = TestEnv::new("crash", FakeExtractor::new(3));
        let done = env.ingest_named("done.mp4");
        let running = env.ingest_named("running.mp4");
        env.batch.enqueue(&[done.id.clone()]).unwrap();
        env.batch.start().unwrap();
        env.wait_idle().await;

        // Simulate a process killed mid-extraction.
        let mut checkpoint = Checkpoint::read(env.batch.dir()).unwrap();
        checkpoint.status = RunStatus::Processing;
        for task in &mut checkpoint.tasks {
            if task.id == running.id {
                task.state = TaskState::RUNNING;
            }
        }
        checkpoint.write(env.batch.dir()).unwrap();

        let reopened = Batch::open(env.batch.dir(), env.services.clone()).unwrap();
        assert_eq!(reopened.status(), RunStatus::Idle);
        assert_eq!(reopened.task(&running.id).unwrap().state, TaskState::ERROR);
        let kept = reopened.task(&done.id).unwrap();
        assert_eq!(kept.state, TaskState::Completed);
        assert_eq!(kept.saved_count, 3);
        assert_eq!(reopened.images(&done.id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_image_trash_and_restore() {
        let env = TestEnv::new("images", FakeExtractor::new(3));
        let task = env.ingest_named("a.mp4");
        env.batch.enqueue(&[task.id.clone()]).unwrap();
        env.batch.start().unwrap();
        env.wait_idle().await;

        assert_eq!(env.batch.trash_image(&task.id, "slide_0001.jpg").unwrap(), 2);
        assert_eq!(env.batch.trashed_images(&task.id).unwrap(), vec!["slide_0001.jpg"]);
        assert!(env.batch.trash_image(&task.id, "slide_0001.jpg").is_err());
        assert_eq!(env.batch.restore_image(&task.id, "slide_0001.jpg").unwrap(), 3);

        env.batch.trash_image(&task.id, "slide_0000.jpg").unwrap();
        env.batch.trash_image(&task.id, "../slide_0002.jpg").unwrap();
        assert_eq!(env.batch.task(&task.id).unwrap().saved_count, 1);
        assert_eq!(env.batch.restore_all_images(&task.id).unwrap(), 2);
        assert_eq!(env.batch.task(&task.id).unwrap().saved_count, 3);
    }

    #[tokio::test]
    async fn test_package_completed_task() {
        let env = TestEnv::new("package", FakeExtractor::new(2));
        let task = env.ingest_named("第2讲.mp4");
        assert!(matches!(
            env.batch.package(&task.id, "images", &DirectoryPackager),
            Err(BatchError::WrongState { .. })
        ));
        env.batch.enqueue(&[task.id.clone()]).unwrap();
        env.batch.start().unwrap();
        env.wait_idle().await;

        let events = env.record_events();
        let name = env.batch.package(&task.id, "images", &DirectoryPackager).unwrap();
        assert!(task.paths().packages().join(&name).join("002.jpg").is_file());
        assert!(matches!(
            env.batch.package(&task.id, "pptx", &DirectoryPackager),
            Err(BatchError::Package(_))
        ));
        let events = events.finish();
        assert!(events.iter().any(|e| matches!(e, BatchEvent::PackagingDone { .. })));
        assert!(events.iter().any(|e| matches!(e, BatchEvent::PackagingError { .. })));
    }
}
