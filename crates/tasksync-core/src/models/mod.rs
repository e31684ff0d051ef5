//! Data models for tasksync

mod queue_item;
mod sync_conflict;
mod task;

pub use queue_item::{DeadLetter, NewQueueItem, QueueAction, QueueItem};
pub use sync_conflict::SyncConflict;
pub use task::{
    ConflictResolution, Location, NewTask, SyncStatus, Task, TaskId, TaskPatch, TaskStatus,
};

/// Wall clock in the epoch-millisecond form every stored timestamp uses
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
