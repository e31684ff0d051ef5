//! JSON wire format shared with the remote API.
//!
//! Timestamps travel as ISO-8601 strings; locally they are Unix millis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RemoteError, RemoteResult};
use crate::models::{Location, Task, TaskStatus};

/// Task body sent on create and update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub location: Option<Location>,
    /// The remote stores a single image; the first local reference is sent
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskPayload {
    pub fn from_task(task: &Task) -> RemoteResult<Self> {
        Ok(Self {
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status,
            price: task.price,
            location: task.location.clone(),
            image_url: task.image_refs.first().cloned(),
            expires_at: task.expires_at.map(millis_to_utc).transpose()?,
            created_at: millis_to_utc(task.created_at)?,
            updated_at: millis_to_utc(task.updated_at)?,
        })
    }
}

/// Body returned by create and update calls
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecordResponse {
    /// Some backends return numeric ids
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub status: TaskStatus,
}

impl RecordResponse {
    /// Normalized string id, if the response carried a usable one
    pub fn id(&self) -> Option<String> {
        match self.id.as_ref()? {
            serde_json::Value::String(id) => {
                let id = id.trim();
                (!id.is_empty()).then(|| id.to_string())
            }
            serde_json::Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }
}

fn millis_to_utc(millis: i64) -> RemoteResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| RemoteError::InvalidPayload(format!("timestamp out of range: {millis}")))
}
