//! Error types for tasksync-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Longest text excerpt carried inside an error message
const MAX_DETAIL_CHARS: usize = 180;

/// Result type alias using tasksync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tasksync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// `SQLite` error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Task (or other record) not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input rejected before persistence
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote backend failure that is not a connectivity outage
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

/// Trim `detail` and cap it at [`MAX_DETAIL_CHARS`] characters
pub(crate) fn compact_detail(detail: &str) -> String {
    detail.trim().chars().take(MAX_DETAIL_CHARS).collect()
}
