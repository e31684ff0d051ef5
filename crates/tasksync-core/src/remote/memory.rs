//! In-process remote authority.
//!
//! Used for offline demos and as the collaborator in engine tests: it can be
//! taken offline, made slow, fed injected failures, and told to report a
//! divergent status on the next update of a record.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{RemoteClient, RemoteError, RemoteRecord, RemoteResult, UpdateReply};
use crate::models::{Task, TaskStatus};

/// A record held by [`InMemoryRemote`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTask {
    pub title: String,
    pub status: TaskStatus,
}

/// Number of calls received per operation, including failed ones
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
}

impl CallCounts {
    pub const fn total(&self) -> usize {
        self.create + self.update + self.delete
    }
}

#[derive(Debug)]
struct State {
    reachable: bool,
    latency: Option<Duration>,
    next_id: u64,
    records: BTreeMap<String, RemoteTask>,
    divergent: HashMap<String, TaskStatus>,
    failures: VecDeque<RemoteError>,
    calls: CallCounts,
}

impl Default for State {
    fn default() -> Self {
        Self {
            reachable: true,
            latency: None,
            next_id: 1,
            records: BTreeMap::new(),
            divergent: HashMap::new(),
            failures: VecDeque::new(),
            calls: CallCounts::default(),
        }
    }
}

/// Cloneable handle to a shared in-memory remote
#[derive(Clone, Debug, Default)]
pub struct InMemoryRemote {
    state: Arc<Mutex<State>>,
}

impl InMemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate network loss or recovery
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Fail the next call (of any kind) with `error`
    pub fn fail_next(&self, error: RemoteError) {
        self.lock().failures.push_back(error);
    }

    /// Make the next update of `server_id` ignore the client's status and
    /// report `status` instead, as if another actor changed it first
    pub fn diverge_next_update(&self, server_id: &str, status: TaskStatus) {
        let mut state = self.lock();
        if let Some(record) = state.records.get_mut(server_id) {
            record.status = status;
        }
        state.divergent.insert(server_id.to_string(), status);
    }

    /// Insert a record directly, as if created by another client
    pub fn insert(&self, server_id: &str, title: &str, status: TaskStatus) {
        self.lock().records.insert(
            server_id.to_string(),
            RemoteTask {
                title: title.to_string(),
                status,
            },
        );
    }

    /// Drop a record, as after a server-side data reset
    pub fn remove(&self, server_id: &str) -> Option<RemoteTask> {
        self.lock().records.remove(server_id)
    }

    pub fn record(&self, server_id: &str) -> Option<RemoteTask> {
        self.lock().records.get(server_id).cloned()
    }

    pub fn records(&self) -> BTreeMap<String, RemoteTask> {
        self.lock().records.clone()
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl RemoteClient for InMemoryRemote {
    async fn create_remote(&self, task: &Task) -> RemoteResult<Option<RemoteRecord>> {
        self.lock().calls.create += 1;
        self.simulate_latency().await;

        let mut state = self.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if !state.reachable {
            return Ok(None);
        }

        let id = format!("srv-{}", state.next_id);
        state.next_id += 1;
        state.records.insert(
            id.clone(),
            RemoteTask {
                title: task.title.clone(),
                status: task.status,
            },
        );
        Ok(Some(RemoteRecord {
            id,
            status: task.status,
        }))
    }

    async fn update_remote(&self, server_id: &str, task: &Task) -> RemoteResult<UpdateReply> {
        self.lock().calls.update += 1;
        self.simulate_latency().await;

        let mut state = self.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if !state.reachable {
            return Ok(UpdateReply::Unreachable);
        }

        let divergent = state.divergent.remove(server_id);
        let Some(record) = state.records.get_mut(server_id) else {
            return Ok(UpdateReply::NotFound);
        };

        record.title.clone_from(&task.title);
        if let Some(status) = divergent {
            record.status = status;
        } else {
            record.status = task.status;
        }
        Ok(UpdateReply::Applied(record.status))
    }

    async fn delete_remote(&self, server_id: &str) -> RemoteResult<()> {
        self.lock().calls.delete += 1;
        self.simulate_latency().await;

        let mut state = self.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if !state.reachable {
            return Err(RemoteError::Unreachable);
        }

        state
            .records
            .remove(server_id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(server_id.to_string()))
    }
}
