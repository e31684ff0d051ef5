//! Database layer for tasksync

mod change_queue;
mod connection;
mod migrations;
mod task_store;

pub use change_queue::{ChangeQueue, DrainReport, ProcessError, DEFAULT_MAX_ATTEMPTS};
pub use connection::Database;
pub use migrations::CURRENT_VERSION as SCHEMA_VERSION;
pub use task_store::{MarkOutcome, ResolvedConflict, TaskStore};
