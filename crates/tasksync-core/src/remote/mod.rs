//! Remote authority boundary.
//!
//! An unreachable remote is an expected outcome and is reported as a
//! sentinel (`None`, [`UpdateReply::Unreachable`], or
//! [`RemoteError::Unreachable`] for deletes) so callers can leave work in a
//! retryable state. Every other failure is a [`RemoteError`].

mod http;
mod memory;
mod wire;

use std::future::Future;

use thiserror::Error;

use crate::models::{Task, TaskStatus};

pub use http::HttpRemoteClient;
pub use memory::{CallCounts, InMemoryRemote, RemoteTask};
pub use wire::{RecordResponse, TaskPayload};

/// Errors returned by a remote client
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network unreachable; the operation should be retried later
    #[error("Remote unreachable")]
    Unreachable,
    /// The remote has no record with the requested id
    #[error("Remote record not found: {0}")]
    NotFound(String),
    /// The call did not complete within the configured timeout
    #[error("Remote call timed out")]
    Timeout,
    /// The remote answered with an error status
    #[error("Remote API error: {message} ({status})")]
    Api { status: u16, message: String },
    /// The remote answered with a body we could not understand
    #[error("Invalid remote payload: {0}")]
    InvalidPayload(String),
    /// Transport-level HTTP failure
    #[error("Remote HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Invalid client configuration
    #[error("Invalid remote configuration: {0}")]
    InvalidConfiguration(String),
}

impl RemoteError {
    /// Whether this failure means "try again when connectivity returns"
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Unreachable | Self::Timeout => true,
            Self::Http(error) => error.is_connect() || error.is_timeout(),
            _ => false,
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Record acknowledged by the remote after a create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub id: String,
    pub status: TaskStatus,
}

/// Outcome of an update call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReply {
    /// The remote accepted the update and reports this authoritative status
    Applied(TaskStatus),
    /// The remote has no record with that id (e.g. after a server reset)
    NotFound,
    /// The remote could not be reached
    Unreachable,
}

/// The authoritative backend, keyed by opaque server ids.
pub trait RemoteClient: Send + Sync {
    /// Create a record for `task`. `Ok(None)` means the remote was unreachable.
    fn create_remote(
        &self,
        task: &Task,
    ) -> impl Future<Output = RemoteResult<Option<RemoteRecord>>> + Send;

    /// Push `task` to the record `server_id`
    fn update_remote(
        &self,
        server_id: &str,
        task: &Task,
    ) -> impl Future<Output = RemoteResult<UpdateReply>> + Send;

    /// Delete the record `server_id`.
    ///
    /// Fails with [`RemoteError::NotFound`] or a connectivity error.
    fn delete_remote(&self, server_id: &str) -> impl Future<Output = RemoteResult<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_classification() {
        assert!(RemoteError::Unreachable.is_connectivity());
        assert!(RemoteError::Timeout.is_connectivity());
        assert!(!RemoteError::NotFound("srv-1".into()).is_connectivity());
        assert!(!RemoteError::Api {
            status: 500,
            message: "boom".into()
        }
        .is_connectivity());
    }
}
