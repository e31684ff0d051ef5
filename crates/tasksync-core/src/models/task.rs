//! Task model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A unique identifier for a task, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Generates `as_str`, `Display` and `FromStr` for a snake_case string enum.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable string form used in storage and on the wire
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        "unknown {} value: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

/// User-facing workflow state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Cancelled,
}

string_enum!(TaskStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Done => "done",
    Cancelled => "cancelled",
});

/// Relationship of a local task to the remote authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local changes not yet acknowledged by the remote
    #[default]
    PendingSync,
    /// A sync attempt is in flight (or was interrupted by a crash)
    Syncing,
    /// Remote holds the latest local state
    Synced,
}

string_enum!(SyncStatus {
    PendingSync => "pending_sync",
    Syncing => "syncing",
    Synced => "synced",
});

/// How a status divergence between client and server was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    ClientWins,
    ServerWins,
    Manual,
}

string_enum!(ConflictResolution {
    ClientWins => "client_wins",
    ServerWins => "server_wins",
    Manual => "manual",
});

/// Geographic location attached to a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub address: Option<String>,
}

impl Location {
    fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(Error::InvalidInput(format!(
                "latitude out of range: {}",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(Error::InvalidInput(format!(
                "longitude out of range: {}",
                self.lng
            )));
        }
        Ok(())
    }
}

/// A task in the system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique local identifier
    pub id: TaskId,
    /// Required, non-empty title
    pub title: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub location: Option<Location>,
    /// Image references in display order
    pub image_refs: Vec<String>,
    /// Expiry timestamp (Unix ms)
    pub expires_at: Option<i64>,
    pub status: TaskStatus,
    pub sync_status: SyncStatus,
    /// Identifier assigned by the remote once created there
    pub server_id: Option<String>,
    /// Last status observed from the remote
    pub server_status: Option<TaskStatus>,
    pub conflict_resolution: Option<ConflictResolution>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last local mutation timestamp (Unix ms)
    pub updated_at: i64,
    /// Last successful sync timestamp (Unix ms)
    pub synced_at: Option<i64>,
}

impl Task {
    /// Whether the remote has a record for this task
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        self.server_id.is_some()
    }
}

/// Initial field values for a new task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub location: Option<Location>,
    pub image_refs: Vec<String>,
    pub expires_at: Option<i64>,
}

impl NewTask {
    /// Start a new task with the given title
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub const fn price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    #[must_use]
    pub fn location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    #[must_use]
    pub fn image(mut self, image_ref: impl Into<String>) -> Self {
        self.image_refs.push(image_ref.into());
        self
    }

    #[must_use]
    pub const fn expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Validate and materialize a task stamped with `now`
    pub(crate) fn into_task(self, now: i64) -> Result<Task> {
        let title = validate_title(&self.title)?;
        validate_price(self.price)?;
        if let Some(location) = &self.location {
            location.validate()?;
        }

        Ok(Task {
            id: TaskId::new(),
            title,
            description: self.description,
            price: self.price,
            location: self.location,
            image_refs: self.image_refs,
            expires_at: self.expires_at,
            status: TaskStatus::Pending,
            sync_status: SyncStatus::PendingSync,
            server_id: None,
            server_status: None,
            conflict_resolution: None,
            created_at: now,
            updated_at: now,
            synced_at: None,
        })
    }
}

/// A partial update to a task's user-editable fields.
///
/// Clearable fields use `Option<Option<_>>`: `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub price: Option<Option<f64>>,
    pub location: Option<Option<Location>>,
    pub image_refs: Option<Vec<String>>,
    pub expires_at: Option<Option<i64>>,
    pub status: Option<TaskStatus>,
}

impl TaskPatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = Some(description);
        self
    }

    #[must_use]
    pub const fn price(mut self, price: Option<f64>) -> Self {
        self.price = Some(price);
        self
    }

    #[must_use]
    pub fn location(mut self, location: Option<Location>) -> Self {
        self.location = Some(location);
        self
    }

    #[must_use]
    pub fn image_refs(mut self, image_refs: Vec<String>) -> Self {
        self.image_refs = Some(image_refs);
        self
    }

    #[must_use]
    pub const fn expires_at(mut self, expires_at: Option<i64>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub const fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether the patch touches no field at all
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.price.is_none()
            && self.location.is_none()
            && self.image_refs.is_none()
            && self.expires_at.is_none()
            && self.status.is_none()
    }

    /// Apply the patch as a local user edit.
    ///
    /// The task re-enters `PendingSync` and `updated_at` advances. A status
    /// change clears any earlier conflict tag since the user has now decided.
    pub(crate) fn apply(self, task: &mut Task, now: i64) -> Result<()> {
        if let Some(title) = self.title {
            task.title = validate_title(&title)?;
        }
        if let Some(description) = self.description {
            task.description = description;
        }
        if let Some(price) = self.price {
            validate_price(price)?;
            task.price = price;
        }
        if let Some(location) = self.location {
            if let Some(location) = &location {
                location.validate()?;
            }
            task.location = location;
        }
        if let Some(image_refs) = self.image_refs {
            task.image_refs = image_refs;
        }
        if let Some(expires_at) = self.expires_at {
            task.expires_at = expires_at;
        }
        if let Some(status) = self.status {
            if status != task.status {
                task.conflict_resolution = None;
            }
            task.status = status;
        }

        task.sync_status = SyncStatus::PendingSync;
        task.updated_at = now.max(task.updated_at).max(task.created_at);
        Ok(())
    }
}

fn validate_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(Error::InvalidInput("task title cannot be empty".into()));
    }
    Ok(title.to_string())
}

fn validate_price(price: Option<f64>) -> Result<()> {
    match price {
        Some(price) if !price.is_finite() => Err(Error::InvalidInput(format!(
            "task price must be a finite number, got {price}"
        ))),
        _ => Ok(()),
    }
}
