// Batch scheduling: task zones, the dispatcher, persistence and events.

pub mod admission;
pub mod checkpoint;
mod dispatcher;
pub mod events;
pub mod registry;
pub mod scheduler;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};

pub use events::{BatchEvent, EventHub};
pub use registry::BatchRegistry;
pub use scheduler::{Ack, Batch, BatchServices, IngestEntry};
pub use task::{ArchiveReason, RestoreMode, TaskRecord, TaskState};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Processing,
}
