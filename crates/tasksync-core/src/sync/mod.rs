//! Reconciliation of local tasks with the remote authority.

mod conflict;
mod engine;

pub use conflict::{is_conflict, resolve_conflict, ConflictOutcome};
pub use engine::{
    SkipReason, SyncEngine, SyncOptions, SyncOutcome, SyncReport, SyncStatusSnapshot, SyncWorkers,
};
