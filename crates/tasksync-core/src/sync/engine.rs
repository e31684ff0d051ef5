//! Sync engine: pushes pending local tasks to the remote and drains the
//! change queue.
//!
//! A run visits every `pending_sync` (or stranded `syncing`) task in order of
//! its last edit, then processes queued remote operations. Runs are
//! single-flight: a call made while another is active returns immediately
//! with [`SyncOutcome::Skipped`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::conflict::{is_conflict, resolve_conflict, ConflictOutcome};
use crate::config::{SyncSettings, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::connectivity::ConnectivityMonitor;
use crate::db::{
    ChangeQueue, DrainReport, MarkOutcome, ProcessError, ResolvedConflict, TaskStore,
};
use crate::error::{Error, Result};
use crate::events::{ListenerId, ListenerRegistry, Subscription};
use crate::models::{
    now_millis, ConflictResolution, NewQueueItem, QueueAction, QueueItem, Task, TaskStatus,
};
use crate::remote::{RemoteClient, RemoteError, RemoteRecord, RemoteResult, UpdateReply};

/// Tunables for a [`SyncEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Upper bound for a single remote call; elapsed counts as unreachable
    pub request_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// Sent to status listeners on every connectivity or syncing transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatusSnapshot {
    pub online: bool,
    pub syncing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
}

/// Counts from one completed run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Tasks that reached `synced` without a conflict
    pub synced: usize,
    /// Tasks left `pending_sync` for a later run (unreachable, timed out,
    /// edited mid-flight, or not visited after going offline)
    pub deferred: usize,
    /// Tasks whose sync failed with an unexpected error
    pub failed: usize,
    /// Conflicts resolved during the run
    pub conflicts: usize,
    pub queue: DrainReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Completed(SyncReport),
}

impl SyncOutcome {
    #[must_use]
    pub const fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Synced,
    Deferred,
    Conflict,
    /// Deleted locally before or during the attempt
    Gone,
}

/// Reconciles the local store with a remote authority
pub struct SyncEngine<R> {
    store: TaskStore,
    queue: ChangeQueue,
    remote: R,
    connectivity: ConnectivityMonitor,
    options: SyncOptions,
    running: AtomicBool,
    listeners: ListenerRegistry<SyncStatusSnapshot>,
}

impl<R: RemoteClient> SyncEngine<R> {
    pub fn new(
        store: TaskStore,
        queue: ChangeQueue,
        remote: R,
        connectivity: ConnectivityMonitor,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            queue,
            remote,
            connectivity,
            options,
            running: AtomicBool::new(false),
            listeners: ListenerRegistry::new(),
        }
    }

    pub const fn store(&self) -> &TaskStore {
        &self.store
    }

    pub const fn queue(&self) -> &ChangeQueue {
        &self.queue
    }

    pub const fn remote(&self) -> &R {
        &self.remote
    }

    pub const fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SyncStatusSnapshot {
        SyncStatusSnapshot {
            online: self.is_online(),
            syncing: self.is_syncing(),
        }
    }

    /// Register a status listener
    pub fn add_listener(
        &self,
        listener: impl Fn(&SyncStatusSnapshot) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Register a status listener that is removed via the returned handle
    pub fn subscribe(
        &self,
        listener: impl Fn(&SyncStatusSnapshot) + Send + Sync + 'static,
    ) -> Subscription<SyncStatusSnapshot> {
        self.listeners.subscribe(listener)
    }

    /// Run one sync pass.
    ///
    /// Per-task remote failures never abort the run; only local storage
    /// errors are returned.
    pub async fn sync_all(&self) -> Result<SyncOutcome> {
        if !self.is_online() {
            tracing::debug!("Offline, skipping sync");
            return Ok(SyncOutcome::Skipped(SkipReason::Offline));
        }
        let Some(_guard) = RunGuard::acquire(self) else {
            tracing::debug!("Sync already running, skipping");
            return Ok(SyncOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        let tasks = self.store.pending_sync().await?;
        let mut report = SyncReport::default();
        tracing::info!(pending = tasks.len(), "Starting sync");

        for task in tasks {
            if !self.is_online() {
                report.deferred += 1;
                continue;
            }

            let id = task.id;
            match self.sync_task(task).await {
                Ok(TaskOutcome::Synced) => report.synced += 1,
                Ok(TaskOutcome::Deferred) => report.deferred += 1,
                Ok(TaskOutcome::Conflict) => report.conflicts += 1,
                Ok(TaskOutcome::Gone) => {}
                Err(error) => {
                    tracing::warn!(task_id = %id, "Task sync failed: {error}");
                    if let Err(error) = self.store.mark_pending(&id).await {
                        tracing::error!(task_id = %id, "Failed to reset task to pending: {error}");
                    }
                    report.failed += 1;
                }
            }
        }

        report.queue = self
            .queue
            .drain(|| self.is_online(), |item| self.process_queue_item(item))
            .await?;

        tracing::info!(
            synced = report.synced,
            deferred = report.deferred,
            failed = report.failed,
            conflicts = report.conflicts,
            "Sync finished"
        );
        Ok(SyncOutcome::Completed(report))
    }

    async fn sync_task(&self, task: Task) -> Result<TaskOutcome> {
        match self.store.mark_as_syncing(&task.id).await {
            Ok(()) => {}
            Err(Error::NotFound(_)) => return Ok(TaskOutcome::Gone),
            Err(error) => return Err(error),
        }
        // Reload so the push carries edits made after the pending list was read.
        let Some(task) = self.store.get(&task.id).await? else {
            return Ok(TaskOutcome::Gone);
        };

        tracing::debug!(task_id = %task.id, server_id = ?task.server_id, "Syncing task");
        match task.server_id.clone() {
            None => self.push_create(&task).await,
            Some(server_id) => self.push_update(&task, &server_id).await,
        }
    }

    async fn push_create(&self, task: &Task) -> Result<TaskOutcome> {
        match self.call(self.remote.create_remote(task)).await {
            Ok(Some(record)) => self.settle_created(task, record).await,
            Ok(None) => self.defer(task).await,
            Err(error) if error.is_connectivity() => self.defer(task).await,
            Err(error) => Err(error.into()),
        }
    }

    async fn settle_created(&self, task: &Task, record: RemoteRecord) -> Result<TaskOutcome> {
        let outcome = self
            .store
            .mark_as_synced(&task.id, &record.id, record.status)
            .await?;
        if outcome == MarkOutcome::Missing {
            tracing::debug!(
                task_id = %task.id,
                server_id = %record.id,
                "Task deleted during create, queueing remote delete"
            );
            self.queue
                .enqueue(NewQueueItem::delete(record.id, now_millis()))
                .await?;
        }
        Ok(mark_to_outcome(outcome, TaskOutcome::Synced))
    }

    async fn push_update(&self, task: &Task, server_id: &str) -> Result<TaskOutcome> {
        match self.call(self.remote.update_remote(server_id, task)).await {
            Ok(UpdateReply::Applied(observed)) => self.reconcile(task, server_id, observed).await,
            Ok(UpdateReply::NotFound) => {
                tracing::info!(task_id = %task.id, server_id, "Remote record missing, recreating");
                self.push_create(task).await
            }
            Ok(UpdateReply::Unreachable) => self.defer(task).await,
            Err(error) if error.is_connectivity() => self.defer(task).await,
            Err(error) => Err(error.into()),
        }
    }

    async fn reconcile(
        &self,
        task: &Task,
        server_id: &str,
        observed: TaskStatus,
    ) -> Result<TaskOutcome> {
        let conflict = is_conflict(task.status, task.server_status, observed)
            .then(|| resolve_conflict(task.status, observed))
            .flatten();
        let Some(conflict) = conflict else {
            let outcome = self.store.mark_as_synced(&task.id, server_id, observed).await?;
            return Ok(mark_to_outcome(outcome, TaskOutcome::Synced));
        };

        tracing::info!(
            task_id = %task.id,
            local = %task.status,
            server = %observed,
            resolution = %conflict.resolution,
            "Resolving status conflict"
        );

        let (server_status, settled) = match conflict.resolution {
            ConflictResolution::ClientWins => {
                self.push_winning_status(task, server_id, conflict, observed)
                    .await
            }
            ConflictResolution::ServerWins | ConflictResolution::Manual => (observed, true),
        };

        let outcome = self
            .store
            .resolve_conflict(
                &task.id,
                ResolvedConflict {
                    resolution: conflict.resolution,
                    final_status: conflict.final_status,
                    observed_status: observed,
                    server_status,
                    settled,
                },
            )
            .await?;
        Ok(mark_to_outcome(outcome, TaskOutcome::Conflict))
    }

    /// Push the client's status over a divergent server status. Returns the
    /// server status to record and whether the task is settled.
    async fn push_winning_status(
        &self,
        task: &Task,
        server_id: &str,
        conflict: ConflictOutcome,
        observed: TaskStatus,
    ) -> (TaskStatus, bool) {
        let mut winning = task.clone();
        winning.status = conflict.final_status;

        match self.call(self.remote.update_remote(server_id, &winning)).await {
            Ok(UpdateReply::Applied(status)) => (status, true),
            Ok(UpdateReply::NotFound | UpdateReply::Unreachable) => (observed, false),
            Err(error) => {
                if !error.is_connectivity() {
                    tracing::warn!(task_id = %task.id, "Failed to push winning status: {error}");
                }
                (observed, false)
            }
        }
    }

    async fn defer(&self, task: &Task) -> Result<TaskOutcome> {
        tracing::debug!(task_id = %task.id, "Remote unreachable, task stays pending");
        self.store.mark_pending(&task.id).await?;
        Ok(TaskOutcome::Deferred)
    }

    async fn process_queue_item(&self, item: QueueItem) -> std::result::Result<(), ProcessError> {
        match item.action {
            QueueAction::Delete => match self.call(self.remote.delete_remote(&item.task_id)).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => Ok(()),
                Err(error) => Err(process_error(&error)),
            },
            QueueAction::Create => {
                let task = queued_task(&item)?;
                match self.call(self.remote.create_remote(&task)).await {
                    Ok(Some(record)) => self.attach_queued_create(&task, record).await,
                    Ok(None) => Err(ProcessError::Unreachable),
                    Err(error) => Err(process_error(&error)),
                }
            }
            QueueAction::Update => {
                let task = queued_task(&item)?;
                match self.call(self.remote.update_remote(&item.task_id, &task)).await {
                    Ok(UpdateReply::Applied(_)) => Ok(()),
                    Ok(UpdateReply::Unreachable) => Err(ProcessError::Unreachable),
                    Ok(UpdateReply::NotFound) => Err(ProcessError::Failed(format!(
                        "remote record {} not found",
                        item.task_id
                    ))),
                    Err(error) => Err(process_error(&error)),
                }
            }
        }
    }

    async fn attach_queued_create(
        &self,
        task: &Task,
        record: RemoteRecord,
    ) -> std::result::Result<(), ProcessError> {
        let outcome = self
            .store
            .mark_as_synced(&task.id, &record.id, record.status)
            .await
            .map_err(|error| ProcessError::Failed(error.to_string()))?;
        if outcome == MarkOutcome::Missing {
            self.queue
                .enqueue(NewQueueItem::delete(record.id, now_millis()))
                .await
                .map_err(|error| ProcessError::Failed(error.to_string()))?;
        }
        Ok(())
    }

    async fn call<T>(&self, request: impl Future<Output = RemoteResult<T>>) -> RemoteResult<T> {
        tokio::time::timeout(self.options.request_timeout, request)
            .await
            .unwrap_or(Err(RemoteError::Timeout))
    }

    fn notify_status(&self) {
        self.listeners.emit(&self.status());
    }
}

impl<R: RemoteClient + 'static> SyncEngine<R> {
    /// Watch connectivity: notify status listeners on every transition and
    /// start one sync per offline-to-online edge.
    ///
    /// Transitions are captured by a monitor listener at the moment they
    /// happen, so edges made before the returned task is first polled are
    /// still handled in order.
    pub fn spawn_connectivity_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let (sender, mut transitions) = mpsc::unbounded_channel();
        let subscription = self.connectivity.on_change(move |online| {
            // The receiver is gone once the watch task ends.
            let _ = sender.send(*online);
        });

        let listener = ListenerGuard(Some(subscription));

        tokio::spawn(async move {
            let _listener = listener;
            while let Some(online) = transitions.recv().await {
                engine.listeners.emit(&SyncStatusSnapshot {
                    online,
                    syncing: engine.is_syncing(),
                });

                if online {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move { engine.run_logged("connectivity restored").await });
                }
            }
        })
    }

    /// Start the connectivity watch and, unless disabled in `settings`, the
    /// background loop.
    pub fn start(self: &Arc<Self>, settings: &SyncSettings) -> SyncWorkers {
        SyncWorkers {
            connectivity: self.spawn_connectivity_watch(),
            background: settings
                .background_interval()
                .map(|interval| self.spawn_background_sync(interval)),
        }
    }

    /// Run `sync_all` every `interval` while online
    pub fn spawn_background_sync(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if engine.is_online() {
                    engine.run_logged("background").await;
                }
            }
        })
    }

    async fn run_logged(&self, trigger: &'static str) {
        match self.sync_all().await {
            Ok(SyncOutcome::Completed(report)) => {
                tracing::debug!(trigger, synced = report.synced, "Triggered sync completed");
            }
            Ok(SyncOutcome::Skipped(reason)) => {
                tracing::debug!(trigger, ?reason, "Triggered sync skipped");
            }
            Err(error) => tracing::error!(trigger, "Triggered sync failed: {error}"),
        }
    }
}

/// Tasks spawned by [`SyncEngine::start`]
#[derive(Debug)]
pub struct SyncWorkers {
    pub connectivity: JoinHandle<()>,
    /// `None` when the background loop is disabled
    pub background: Option<JoinHandle<()>>,
}

impl SyncWorkers {
    pub fn abort(&self) {
        self.connectivity.abort();
        if let Some(background) = &self.background {
            background.abort();
        }
    }
}

/// Removes the connectivity listener when the watch task ends or is aborted
struct ListenerGuard(Option<Subscription<bool>>);

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(subscription) = self.0.take() {
            subscription.unsubscribe();
        }
    }
}

/// Holds the single-flight flag for the duration of a run
struct RunGuard<'a, R: RemoteClient> {
    engine: &'a SyncEngine<R>,
}

impl<'a, R: RemoteClient> RunGuard<'a, R> {
    fn acquire(engine: &'a SyncEngine<R>) -> Option<Self> {
        engine
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        engine.notify_status();
        Some(Self { engine })
    }
}

impl<R: RemoteClient> Drop for RunGuard<'_, R> {
    fn drop(&mut self) {
        self.engine.running.store(false, Ordering::Release);
        self.engine.notify_status();
    }
}

const fn mark_to_outcome(outcome: MarkOutcome, applied: TaskOutcome) -> TaskOutcome {
    match outcome {
        MarkOutcome::Applied => applied,
        MarkOutcome::Superseded => TaskOutcome::Deferred,
        MarkOutcome::Missing => TaskOutcome::Gone,
    }
}

fn process_error(error: &RemoteError) -> ProcessError {
    if error.is_connectivity() {
        ProcessError::Unreachable
    } else {
        ProcessError::Failed(error.to_string())
    }
}

fn queued_task(item: &QueueItem) -> std::result::Result<Task, ProcessError> {
    let data = item.data.clone().ok_or_else(|| {
        ProcessError::Failed(format!("{} item {} has no task payload", item.action, item.seq))
    })?;
    serde_json::from_value(data).map_err(|error| ProcessError::Failed(error.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::Database;
    use crate::models::{NewTask, SyncStatus, TaskId, TaskPatch};
    use crate::remote::InMemoryRemote;

    struct Harness {
        engine: SyncEngine<InMemoryRemote>,
        remote: InMemoryRemote,
        connectivity: ConnectivityMonitor,
    }

    fn harness_with(queue_attempts: u32, options: SyncOptions) -> Harness {
        let db = Database::open_in_memory().unwrap();
        let store = TaskStore::new(db.clone());
        let queue = ChangeQueue::new(db).with_max_attempts(queue_attempts);
        let remote = InMemoryRemote::new();
        let connectivity = ConnectivityMonitor::new(true);
        let engine = SyncEngine::new(
            store,
            queue,
            remote.clone(),
            connectivity.clone(),
            options,
        );
        Harness {
            engine,
            remote,
            connectivity,
        }
    }

    fn harness() -> Harness {
        harness_with(3, SyncOptions::default())
    }

    fn completed(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Completed(report) => report,
            SyncOutcome::Skipped(reason) => panic!("sync skipped: {reason:?}"),
        }
    }

    async fn synced_task(h: &Harness, title: &str) -> Task {
        let task = h.engine.store().create(NewTask::new(title)).await.unwrap();
        completed(h.engine.sync_all().await.unwrap());
        h.engine.store().find(&task.id).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_creates_remote_record() {
        let h = harness();
        let task = h.engine.store().create(NewTask::new("Audit 1")).await.unwrap();

        let report = completed(h.engine.sync_all().await.unwrap());
        let task = h.engine.store().find(&task.id).await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(task.sync_status, SyncStatus::Synced);
        assert_eq!(task.server_id.as_deref(), Some("srv-1"));
        assert_eq!(task.server_status, Some(TaskStatus::Pending));
        assert!(task.synced_at.is_some());
        assert_eq!(h.remote.record("srv-1").unwrap().title, "Audit 1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_sync_makes_no_calls() {
        let h = harness();
        let task = h.engine.store().create(NewTask::new("Audit 1")).await.unwrap();
        h.connectivity.set_online(false);

        let outcome = h.engine.sync_all().await.unwrap();

        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Offline));
        assert_eq!(h.remote.calls().total(), 0);
        assert_eq!(h.engine.store().find(&task.id).await.unwrap(), task);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overlapping_sync_is_skipped() {
        let h = harness();
        h.engine.store().create(NewTask::new("slow")).await.unwrap();
        h.remote.set_latency(Some(Duration::from_millis(100)));

        let (first, second) = tokio::join!(h.engine.sync_all(), h.engine.sync_all());

        assert_eq!(completed(first.unwrap()).synced, 1);
        assert_eq!(
            second.unwrap(),
            SyncOutcome::Skipped(SkipReason::AlreadyRunning)
        );
        assert_eq!(h.remote.calls().create, 1);
        assert!(!h.engine.is_syncing());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_create_stays_pending() {
        let h = harness();
        let task = h.engine.store().create(NewTask::new("Audit 1")).await.unwrap();
        h.remote.set_reachable(false);

        let report = completed(h.engine.sync_all().await.unwrap());
        let task = h.engine.store().find(&task.id).await.unwrap();

        assert_eq!(report.deferred, 1);
        assert_eq!(task.sync_status, SyncStatus::PendingSync);
        assert_eq!(task.server_id, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timed_out_call_is_deferred() {
        let h = harness_with(
            3,
            SyncOptions {
                request_timeout: Duration::from_millis(20),
            },
        );
        let task = h.engine.store().create(NewTask::new("slow")).await.unwrap();
        h.remote.set_latency(Some(Duration::from_millis(300)));

        let report = completed(h.engine.sync_all().await.unwrap());

        assert_eq!(report.deferred, 1);
        assert_eq!(
            h.engine.store().find(&task.id).await.unwrap().sync_status,
            SyncStatus::PendingSync
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unexpected_error_resets_task_and_continues() {
        let h = harness();
        let first = h.engine.store().create(NewTask::new("first")).await.unwrap();
        let second = h.engine.store().create(NewTask::new("second")).await.unwrap();
        h.remote.fail_next(RemoteError::Api {
            status: 500,
            message: "boom".into(),
        });

        let report = completed(h.engine.sync_all().await.unwrap());

        assert_eq!(report.failed, 1);
        assert_eq!(report.synced, 1);
        let store = h.engine.store();
        assert_eq!(
            store.find(&first.id).await.unwrap().sync_status,
            SyncStatus::PendingSync
        );
        assert_eq!(
            store.find(&second.id).await.unwrap().sync_status,
            SyncStatus::Synced
        );

        completed(h.engine.sync_all().await.unwrap());
        assert_eq!(
            store.find(&first.id).await.unwrap().sync_status,
            SyncStatus::Synced
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_wins_pushes_done_over_cancelled() {
        let h = harness();
        let task = synced_task(&h, "audit").await;
        let server_id = task.server_id.clone().unwrap();

        h.engine
            .store()
            .update(&task.id, TaskPatch::new().status(TaskStatus::Done))
            .await
            .unwrap();
        h.remote
            .diverge_next_update(&server_id, TaskStatus::Cancelled);

        let report = completed(h.engine.sync_all().await.unwrap());
        let task = h.engine.store().find(&task.id).await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.sync_status, SyncStatus::Synced);
        assert_eq!(task.conflict_resolution, Some(ConflictResolution::ClientWins));
        assert_eq!(task.server_status, Some(TaskStatus::Done));
        assert_eq!(h.remote.record(&server_id).unwrap().status, TaskStatus::Done);

        let log = h.engine.store().list_conflicts(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].server_status, TaskStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_wins_adopts_done() {
        let h = harness();
        let task = synced_task(&h, "audit").await;
        let server_id = task.server_id.clone().unwrap();

        h.engine
            .store()
            .update(&task.id, TaskPatch::new().status(TaskStatus::Cancelled))
            .await
            .unwrap();
        h.remote.diverge_next_update(&server_id, TaskStatus::Done);

        completed(h.engine.sync_all().await.unwrap());
        let task = h.engine.store().find(&task.id).await.unwrap();

        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.sync_status, SyncStatus::Synced);
        assert_eq!(task.conflict_resolution, Some(ConflictResolution::ServerWins));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn other_mismatch_is_manual_and_keeps_local() {
        let h = harness();
        let task = synced_task(&h, "audit").await;
        let server_id = task.server_id.clone().unwrap();

        h.engine
            .store()
            .update(&task.id, TaskPatch::new().status(TaskStatus::InProgress))
            .await
            .unwrap();
        h.remote.diverge_next_update(&server_id, TaskStatus::Done);

        completed(h.engine.sync_all().await.unwrap());
        let task = h.engine.store().find(&task.id).await.unwrap();

        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.server_status, Some(TaskStatus::Done));
        assert_eq!(task.sync_status, SyncStatus::Synced);
        assert_eq!(task.conflict_resolution, Some(ConflictResolution::Manual));

        // Terminal until the user edits the task again.
        let calls = h.remote.calls();
        completed(h.engine.sync_all().await.unwrap());
        assert_eq!(h.remote.calls(), calls);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_tag_clears_once_server_agrees() {
        let h = harness();
        let task = synced_task(&h, "audit").await;
        let server_id = task.server_id.clone().unwrap();

        h.engine
            .store()
            .update(&task.id, TaskPatch::new().status(TaskStatus::InProgress))
            .await
            .unwrap();
        h.remote.diverge_next_update(&server_id, TaskStatus::Done);
        completed(h.engine.sync_all().await.unwrap());
        assert_eq!(
            h.engine.store().find(&task.id).await.unwrap().conflict_resolution,
            Some(ConflictResolution::Manual)
        );

        h.engine
            .store()
            .update(&task.id, TaskPatch::new().title("audit v2"))
            .await
            .unwrap();
        let report = completed(h.engine.sync_all().await.unwrap());
        let task = h.engine.store().find(&task.id).await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.server_status, Some(TaskStatus::InProgress));
        assert_eq!(task.conflict_resolution, None);
        assert_eq!(task.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_remote_record_is_recreated() {
        let h = harness();
        let task = synced_task(&h, "audit").await;
        h.remote.remove("srv-1");

        h.engine
            .store()
            .update(&task.id, TaskPatch::new().title("audit v2"))
            .await
            .unwrap();
        completed(h.engine.sync_all().await.unwrap());
        let task = h.engine.store().find(&task.id).await.unwrap();

        assert_eq!(task.server_id.as_deref(), Some("srv-2"));
        assert_eq!(task.sync_status, SyncStatus::Synced);
        assert_eq!(h.remote.record("srv-2").unwrap().title, "audit v2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edit_during_push_supersedes_sync() {
        let h = harness();
        let task = h.engine.store().create(NewTask::new("draft")).await.unwrap();
        h.remote.set_latency(Some(Duration::from_millis(150)));

        let edit = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            h.engine
                .store()
                .update(&task.id, TaskPatch::new().title("final"))
                .await
                .unwrap();
        };
        let (outcome, ()) = tokio::join!(h.engine.sync_all(), edit);

        let report = completed(outcome.unwrap());
        let task = h.engine.store().find(&task.id).await.unwrap();

        assert_eq!(report.deferred, 1);
        assert_eq!(task.title, "final");
        assert_eq!(task.sync_status, SyncStatus::PendingSync);
        assert_eq!(task.server_id.as_deref(), Some("srv-1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_delete_is_drained() {
        let h = harness();
        let task = synced_task(&h, "audit").await;
        h.engine.store().delete(&task.id).await.unwrap();
        assert_eq!(h.engine.queue().len().await.unwrap(), 1);

        let report = completed(h.engine.sync_all().await.unwrap());

        assert_eq!(report.queue.processed, 1);
        assert!(h.remote.records().is_empty());
        assert!(h.engine.queue().is_empty().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_of_missing_record_counts_as_done() {
        let h = harness();
        h.engine
            .queue()
            .enqueue(NewQueueItem::delete("srv-404", now_millis()))
            .await
            .unwrap();

        let report = completed(h.engine.sync_all().await.unwrap());

        assert_eq!(report.queue.processed, 1);
        assert!(h.engine.queue().is_empty().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_queue_item_is_dead_lettered() {
        let h = harness_with(1, SyncOptions::default());
        h.remote.insert("srv-7", "doomed", TaskStatus::Pending);
        h.engine
            .queue()
            .enqueue(NewQueueItem::delete("srv-7", now_millis()))
            .await
            .unwrap();
        h.remote.fail_next(RemoteError::Api {
            status: 403,
            message: "forbidden".into(),
        });

        let report = completed(h.engine.sync_all().await.unwrap());

        assert_eq!(report.queue.dead_lettered, 1);
        let dead = h.engine.queue().dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].last_error.contains("forbidden"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_create_attaches_server_id() {
        let h = harness();
        h.remote.set_reachable(false);
        let task = h.engine.store().create(NewTask::new("queued")).await.unwrap();
        h.engine
            .queue()
            .enqueue(NewQueueItem {
                task_id: task.id.as_str(),
                action: QueueAction::Create,
                timestamp: now_millis(),
                data: Some(serde_json::to_value(&task).unwrap()),
            })
            .await
            .unwrap();
        h.engine.store().delete(&task.id).await.unwrap();
        h.remote.set_reachable(true);

        let report = completed(h.engine.sync_all().await.unwrap());

        // Created remotely, then deleted again because the local task is gone.
        assert_eq!(report.queue.processed, 1);
        assert_eq!(h.remote.calls().create, 1);
        assert_eq!(h.engine.queue().len().await.unwrap(), 1);
        completed(h.engine.sync_all().await.unwrap());
        assert!(h.remote.records().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listeners_see_syncing_transitions() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = h
            .engine
            .add_listener(move |status| sink.lock().unwrap().push(status.syncing));

        completed(h.engine.sync_all().await.unwrap());
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);

        assert!(h.engine.remove_listener(id));
        completed(h.engine.sync_all().await.unwrap());
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    async fn wait_until_synced(engine: &SyncEngine<InMemoryRemote>, id: &TaskId) -> bool {
        for _ in 0..50 {
            let current = engine.store().find(id).await.unwrap();
            if current.sync_status == SyncStatus::Synced {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reconnect_triggers_exactly_one_sync() {
        let h = harness();
        h.connectivity.set_online(false);
        let task = h.engine.store().create(NewTask::new("Audit 1")).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _id = h.engine.add_listener(move |status| sink.lock().unwrap().push(*status));

        let engine = Arc::new(h.engine);
        let watcher = engine.spawn_connectivity_watch();
        h.connectivity.set_online(true);

        assert!(
            wait_until_synced(&engine, &task.id).await,
            "task was not synced after reconnect"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        watcher.abort();

        assert_eq!(h.remote.calls().create, 1);
        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen.first(),
            Some(&SyncStatusSnapshot {
                online: true,
                syncing: false
            })
        );
        assert_eq!(seen.iter().filter(|status| status.syncing).count(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn back_to_back_transitions_still_trigger_sync() {
        let h = harness();
        let task = h.engine.store().create(NewTask::new("Audit 1")).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _id = h
            .engine
            .add_listener(move |status| sink.lock().unwrap().push(status.online));

        let engine = Arc::new(h.engine);
        let watcher = engine.spawn_connectivity_watch();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Neither transition is observed by the watch task before both happen.
        h.connectivity.set_online(false);
        h.connectivity.set_online(true);

        assert!(wait_until_synced(&engine, &task.id).await, "edge was not handled");
        watcher.abort();

        assert_eq!(h.remote.calls().create, 1);
        let seen = seen.lock().unwrap().clone();
        assert_eq!(&seen[..2], &[false, true]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn staying_online_does_not_trigger_sync() {
        let h = harness();
        let task = h.engine.store().create(NewTask::new("Audit 1")).await.unwrap();

        let engine = Arc::new(h.engine);
        let watcher = engine.spawn_connectivity_watch();
        for _ in 0..3 {
            assert!(!h.connectivity.set_online(true));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        watcher.abort();

        assert_eq!(h.remote.calls().total(), 0);
        assert_eq!(
            engine.store().find(&task.id).await.unwrap().sync_status,
            SyncStatus::PendingSync
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn aborted_watch_removes_its_listener() {
        let h = harness();
        let engine = Arc::new(h.engine);
        let watcher = engine.spawn_connectivity_watch();
        tokio::time::sleep(Duration::from_millis(20)).await;

        watcher.abort();
        assert!(watcher.await.unwrap_err().is_cancelled());
        h.connectivity.set_online(false);
        h.connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.remote.calls().total(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_honours_disabled_background_loop() {
        let h = harness();
        let engine = Arc::new(h.engine);
        let settings = SyncSettings {
            background_interval_secs: 0,
            ..SyncSettings::default()
        };

        let workers = engine.start(&settings);
        assert!(workers.background.is_none());
        workers.abort();

        let workers = engine.start(&SyncSettings::default());
        assert!(workers.background.is_some());
        workers.abort();
    }
}
