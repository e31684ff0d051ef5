//! Sync conflict model

use serde::{Deserialize, Serialize};

use super::{ConflictResolution, TaskStatus};

/// Recorded status conflict and how it was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Local task involved in the conflict
    pub task_id: String,
    /// Status held locally when the conflict was detected
    pub local_status: TaskStatus,
    /// Status reported by the remote
    pub server_status: TaskStatus,
    /// Status the task ended up with
    pub final_status: TaskStatus,
    pub resolution: ConflictResolution,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
}
