use crate::error::BatchError;
use crate::extract::CancelFlag;
use crate::run_context::TaskPaths;
use crate::video::VideoMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    Running,
    Error,
}

/// Zone and, inside the queue, the status of a task.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "zone", content = "status", rename_all = "snake_case")]
pub enum TaskState {
    Unselected,
    Queue(QueueStatus),
    Completed,
}

impl TaskState {
    pub const WAITING: TaskState = TaskState::Queue(QueueStatus::Waiting);
    pub const RUNNING: TaskState = TaskState::Queue(QueueStatus::Running);
    pub const ERROR: TaskState = TaskState::Queue(QueueStatus::Error);

    pub fn label(self) -> &'static str {
        match self {
            TaskState::Unselected => "unselected",
            TaskState::Queue(QueueStatus::Waiting) => "waiting",
            TaskState::Queue(QueueStatus::Running) => "running",
            TaskState::Queue(QueueStatus::Error) => "error",
            TaskState::Completed => "done",
        }
    }

    pub fn in_queue(self) -> bool {
        matches!(self, TaskState::Queue(_))
    }

    /// Transitions the scheduler may perform. Everything else is a bug or a
    /// user request made in the wrong state.
    pub fn can_become(self, next: TaskState) -> bool {
        use QueueStatus::*;
        use TaskState::*;
        matches!(
            (self, next),
            (Unselected, Queue(Waiting))
                | (Queue(Waiting), Unselected)
                | (Queue(Waiting), Queue(Running))
                | (Queue(Waiting), Queue(Error))
                | (Queue(Running), Completed)
                | (Queue(Running), Queue(Error))
                | (Queue(Error), Queue(Waiting))
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What a running task should do once its worker notices the cancel flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelIntent {
    /// Stay in the queue as a retriable error.
    Stop,
    /// Move to the archive as half-processed.
    Archive,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub video_path: PathBuf,
    pub display_name: String,
    pub state: TaskState,
    pub progress: u8,
    pub last_frame: usize,
    pub saved_count: usize,
    pub eta_seconds: Option<f64>,
    pub elapsed_seconds: f64,
    pub message: String,
    pub error: Option<String>,
    pub retry_count: u32,
    #[serde(default)]
    pub meta: VideoMetadata,
    pub output_dir: PathBuf,
    /// Frame to continue from on the next run instead of starting over.
    #[serde(default)]
    pub resume_from: Option<usize>,
    #[serde(skip)]
    pub(crate) cancel: CancelFlag,
    #[serde(skip)]
    pub(crate) cancel_intent: Option<CancelIntent>,
    #[serde(skip)]
    pub(crate) finished_this_run: bool,
}

impl TaskRecord {
    pub fn new(
        id: String,
        video_path: PathBuf,
        display_name: String,
        meta: VideoMetadata,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            id,
            video_path,
            display_name,
            state: TaskState::Unselected,
            progress: 0,
            last_frame: 0,
            saved_count: 0,
            eta_seconds: None,
            elapsed_seconds: 0.0,
            message: String::new(),
            error: None,
            retry_count: 0,
            meta,
            output_dir,
            resume_from: None,
            cancel: CancelFlag::new(),
            cancel_intent: None,
            finished_this_run: false,
        }
    }

    pub fn paths(&self) -> TaskPaths {
        TaskPaths::new(&self.output_dir)
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::RUNNING
    }

    pub fn is_waiting(&self) -> bool {
        self.state == TaskState::WAITING
    }

    /// Moves to `next` or reports why `action` is not allowed now.
    pub fn transition(&mut self, next: TaskState, action: &'static str) -> Result<(), BatchError> {
        if !self.state.can_become(next) {
            return Err(self.wrong_state(action));
        }
        tracing::debug!("Task {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    pub fn wrong_state(&self, action: &'static str) -> BatchError {
        BatchError::WrongState {
            id: self.id.clone(),
            action,
            state: self.state.to_string(),
        }
    }

    /// Clears run progress. Metadata, name and retry count survive.
    pub fn reset_progress(&mut self) {
        self.progress = 0;
        self.eta_seconds = None;
        self.elapsed_seconds = 0.0;
        self.message.clear();
        self.error = None;
        self.cancel.reset();
        self.cancel_intent = None;
    }

    /// Forgets everything extracted so far.
    pub fn reset_output(&mut self) {
        self.saved_count = 0;
        self.last_frame = 0;
        self.resume_from = None;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveReason {
    Completed,
    Failed,
    /// Removed while running; the partial output is kept.
    HalfProcessed,
}

/// A soft-deleted task with enough state to bring it back.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ArchivedTask {
    pub task: TaskRecord,
    pub reason: ArchiveReason,
    pub archived_at: DateTime<Utc>,
    /// Where the task's files were moved to.
    pub stored_at: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RestoreMode {
    /// Discard output and queue from the start.
    Requeue,
    /// Queue again, continuing after the last processed frame.
    Resume,
    /// Put back as done.
    Completed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TaskRecord {
        TaskRecord::new(
            "t1".into(),
            PathBuf::from("a.mp4"),
            "a".into(),
            VideoMetadata::default(),
            PathBuf::from("out/a"),
        )
    }

    #[test]
    fn test_running_only_from_waiting() {
        assert!(TaskState::WAITING.can_become(TaskState::RUNNING));
        assert!(!TaskState::Unselected.can_become(TaskState::RUNNING));
        assert!(!TaskState::ERROR.can_become(TaskState::RUNNING));
        assert!(!TaskState::Completed.can_become(TaskState::RUNNING));
    }

    #[test]
    fn test_transition_rejects_invalid_move() {
        let mut task = record();
        let err = task.transition(TaskState::Completed, "complete").unwrap_err();
        assert!(matches!(err, BatchError::WrongState { ref state, .. } if state == "unselected"));
        assert_eq!(task.state, TaskState::Unselected);

        task.transition(TaskState::WAITING, "queue").unwrap();
        task.transition(TaskState::RUNNING, "start").unwrap();
        task.transition(TaskState::Completed, "complete").unwrap();
        assert_eq!(task.state.label(), "done");
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&TaskState::RUNNING).unwrap();
        assert_eq!(json, r#"{"zone":"queue","status":"running"}"#);
        let back: TaskState = serde_json::from_str(r#"{"zone":"unselected"}"#).unwrap();
        assert_eq!(back, TaskState::Unselected);
    }

    #[test]
    fn test_transient_flags_not_persisted() {
        let mut task = record();
        task.cancel.cancel();
        task.cancel_intent = Some(CancelIntent::Archive);
        let json = serde_json::to_string(&task).unwrap();
        let back: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cancel_intent, None);
        assert!(!crate::extract::CancelToken::is_cancelled(&back.cancel));
    }
}
