//! tasksync-core - offline-first task store with background sync
//!
//! Tasks are written to a local `SQLite` database first and reconciled with a
//! remote authority whenever connectivity allows. Remote deletes of tasks the
//! server already knows are kept in a durable change queue.

pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod remote;
pub mod sync;

pub use config::SyncSettings;
pub use connectivity::ConnectivityMonitor;
pub use db::{ChangeQueue, Database, TaskStore};
pub use error::{Error, Result};
pub use models::{NewTask, SyncStatus, Task, TaskId, TaskPatch, TaskStatus};
pub use remote::{HttpRemoteClient, InMemoryRemote, RemoteClient, RemoteError};
pub use sync::{SyncEngine, SyncOptions, SyncOutcome, SyncReport};
