use super::checkpoint::BatchSnapshot;
use super::task::{TaskRecord, TaskState};
use super::RunStatus;
use crate::config::EVENT_BUFFER;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Everything a listener can observe about a batch.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    /// First event on every new listener.
    Snapshot { state: Box<BatchSnapshot> },
    TaskAdded { task: Box<TaskRecord> },
    TaskState {
        task_id: String,
        state: TaskState,
        message: String,
        saved_count: usize,
        retry_count: u32,
        global_progress: f64,
    },
    TaskProgress {
        task_id: String,
        saved_count: usize,
        percent: u8,
        message: String,
        eta_seconds: Option<f64>,
        elapsed_seconds: f64,
        current_frame: usize,
        global_progress: f64,
    },
    TaskRenamed { task_id: String, display_name: String },
    TaskArchived { task_id: String },
    TaskDeleted { task_id: String },
    BatchStatus { status: RunStatus, pausing: bool },
    DiskWarning { free_mb: u64 },
    BatchDone {
        completed_count: usize,
        failed_count: usize,
        total_images: usize,
        elapsed_seconds: f64,
    },
    PackagingDone {
        task_id: String,
        name: String,
        format: String,
    },
    PackagingError { task_id: String, message: String },
    /// The batch was removed; listeners end here.
    Closed,
}

/// Fan-out of batch events. Publishing never blocks; slow listeners lose
/// the oldest events.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<BatchEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: BatchEvent) {
        // No listeners is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.tx.subscribe()
    }

    /// Stream that starts with `snapshot`, then follows live events until
    /// the batch closes. `rx` must be subscribed before the snapshot is taken
    /// so nothing falls between the two.
    pub fn listen(
        rx: broadcast::Receiver<BatchEvent>,
        snapshot: BatchSnapshot,
    ) -> impl Stream<Item = BatchEvent> + Send + 'static {
        let mut live = BroadcastStream::new(rx);
        async_stream::stream! {
            yield BatchEvent::Snapshot { state: Box::new(snapshot) };
            while let Some(item) = live.next().await {
                match item {
                    Ok(BatchEvent::Closed) => {
                        yield BatchEvent::Closed;
                        break;
                    }
                    Ok(event) => {
                        yield event;
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::debug!("Events: listener lagged, dropped {} events", skipped);
                    }
                }
            }
        }
    }
}
