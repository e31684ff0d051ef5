//! Change queue item model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Remote operation recorded in the change queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueAction {
    Create,
    Update,
    Delete,
}

impl QueueAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for QueueAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown queue action: {other}"))),
        }
    }
}

/// An operation waiting to be enqueued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQueueItem {
    /// Server-side identifier the operation targets
    pub task_id: String,
    pub action: QueueAction,
    /// Enqueue time (Unix ms)
    pub timestamp: i64,
    /// Optional payload, e.g. a serialized task for create/update
    pub data: Option<serde_json::Value>,
}

impl NewQueueItem {
    /// A remote delete of `server_id`
    pub fn delete(server_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            task_id: server_id.into(),
            action: QueueAction::Delete,
            timestamp,
            data: None,
        }
    }
}

/// A persisted queue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Insertion sequence number; defines processing order
    pub seq: i64,
    pub task_id: String,
    pub action: QueueAction,
    pub timestamp: i64,
    pub data: Option<serde_json::Value>,
    /// Non-connectivity failures seen so far
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// A queue entry that exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    /// Sequence number the item had in the live queue
    pub original_seq: i64,
    pub task_id: String,
    pub action: QueueAction,
    pub timestamp: i64,
    pub data: Option<serde_json::Value>,
    pub attempts: u32,
    pub last_error: String,
    /// When the item was moved out of the live queue (Unix ms)
    pub failed_at: i64,
}
