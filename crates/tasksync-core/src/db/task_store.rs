//! Task store: durable CRUD over the `tasks` table plus change notification

use std::collections::HashMap;
use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::change_queue;
use super::Database;
use crate::error::{Error, Result};
use crate::events::{ListenerRegistry, Subscription};
use crate::models::{
    now_millis, ConflictResolution, Location, NewQueueItem, NewTask, SyncConflict, SyncStatus,
    Task, TaskId, TaskPatch, TaskStatus,
};

const TASK_COLUMNS: &str = "id, title, description, price, location_lat, location_lng, \
     location_address, expires_at, status, sync_status, server_id, server_status, \
     conflict_resolution, created_at, updated_at, synced_at";

/// `syncing` outside an active run means the run was interrupted
const NEEDS_SYNC: &str = "sync_status IN ('pending_sync', 'syncing')";

/// Result of a sync-side write that only applies while a task is `syncing`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The write was applied
    Applied,
    /// The task was edited locally while the remote call was in flight; it
    /// stays `pending_sync` for the next run
    Superseded,
    /// The task was deleted locally while the remote call was in flight
    Missing,
}

/// A conflict decision to persist with [`TaskStore::resolve_conflict`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedConflict {
    pub resolution: ConflictResolution,
    /// Status the task ends up with locally
    pub final_status: TaskStatus,
    /// Divergent status the remote reported; written to the conflict log
    pub observed_status: TaskStatus,
    /// Status the remote holds after resolution
    pub server_status: TaskStatus,
    /// Whether the remote agrees with `final_status` now
    pub settled: bool,
}

/// Durable task storage.
///
/// Every mutating call commits before returning and then invokes all
/// subscribers with the full, freshly loaded task list.
#[derive(Clone)]
pub struct TaskStore {
    db: Database,
    listeners: ListenerRegistry<[Task]>,
}

impl TaskStore {
    /// Create a store over the given database
    pub fn new(db: Database) -> Self {
        Self {
            db,
            listeners: ListenerRegistry::new(),
        }
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Subscribe to the task list after every committed mutation
    pub fn subscribe(
        &self,
        listener: impl Fn(&[Task]) + Send + Sync + 'static,
    ) -> Subscription<[Task]> {
        self.listeners.subscribe(listener)
    }

    /// Create a new task in `pending` / `pending_sync` state
    pub async fn create(&self, new_task: NewTask) -> Result<Task> {
        let task = new_task.into_task(now_millis())?;

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        write_task(&tx, &task, true)?;
        replace_images(&tx, &task.id, &task.image_refs)?;
        tx.commit()?;

        tracing::debug!(task_id = %task.id, "Created task");
        self.notify(&conn);
        Ok(task)
    }

    /// Get a task by ID
    pub async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        let conn = self.db.lock().await;
        load_task(&conn, id)
    }

    /// Get a task by ID, failing with `NotFound` if it doesn't exist
    pub async fn find(&self, id: &TaskId) -> Result<Task> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    /// List all tasks, most recently updated first
    pub async fn list(&self) -> Result<Vec<Task>> {
        let conn = self.db.lock().await;
        list_tasks(&conn)
    }

    /// Tasks the next sync run should visit, oldest edit first.
    ///
    /// Includes `syncing` tasks stranded by an interrupted run.
    pub async fn pending_sync(&self) -> Result<Vec<Task>> {
        let conn = self.db.lock().await;
        query_tasks(
            &conn,
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE {NEEDS_SYNC}
                 ORDER BY updated_at ASC, id ASC"
            ),
        )
    }

    /// Number of tasks waiting for sync
    pub async fn pending_count(&self) -> Result<usize> {
        let conn = self.db.lock().await;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM tasks WHERE {NEEDS_SYNC}"),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Apply a user edit. Any change puts the task back into `pending_sync`.
    pub async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<Task> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let mut task = load_task(&tx, id)?.ok_or_else(|| Error::NotFound(format!("task {id}")))?;

        if patch.is_empty() {
            return Ok(task);
        }

        let images_changed = patch.image_refs.is_some();
        patch.apply(&mut task, now_millis())?;
        write_task(&tx, &task, false)?;
        if images_changed {
            replace_images(&tx, &task.id, &task.image_refs)?;
        }
        tx.commit()?;

        tracing::debug!(task_id = %task.id, "Updated task");
        self.notify(&conn);
        Ok(task)
    }

    /// Delete a task. If the remote knows it, a remote delete is queued in
    /// the same transaction.
    pub async fn delete(&self, id: &TaskId) -> Result<()> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let task = load_task(&tx, id)?.ok_or_else(|| Error::NotFound(format!("task {id}")))?;

        tx.execute("DELETE FROM tasks WHERE id = ?1", params![id.as_str()])?;
        if let Some(server_id) = &task.server_id {
            change_queue::insert_item(&tx, &NewQueueItem::delete(server_id, now_millis()))?;
        }
        tx.commit()?;

        tracing::debug!(
            task_id = %id,
            queued_remote_delete = task.is_remote(),
            "Deleted task"
        );
        self.notify(&conn);
        Ok(())
    }

    /// Mark a task as having an active sync attempt
    pub async fn mark_as_syncing(&self, id: &TaskId) -> Result<()> {
        let conn = self.db.lock().await;
        let rows = conn.execute(
            "UPDATE tasks SET sync_status = 'syncing' WHERE id = ?1",
            params![id.as_str()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("task {id}")));
        }
        self.notify(&conn);
        Ok(())
    }

    /// Return a `syncing` task to `pending_sync` so the next run retries it
    pub async fn mark_pending(&self, id: &TaskId) -> Result<()> {
        let conn = self.db.lock().await;
        let rows = conn.execute(
            "UPDATE tasks SET sync_status = 'pending_sync'
             WHERE id = ?1 AND sync_status = 'syncing'",
            params![id.as_str()],
        )?;
        if rows > 0 {
            self.notify(&conn);
        }
        Ok(())
    }

    /// Record a successful remote write.
    ///
    /// The server id and status are always stored. The task only becomes
    /// `synced` if no local edit happened since `mark_as_syncing`; in that
    /// case a `manual` tag is dropped once the server agrees with the local
    /// status.
    pub async fn mark_as_synced(
        &self,
        id: &TaskId,
        server_id: &str,
        server_status: TaskStatus,
    ) -> Result<MarkOutcome> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let Some(current) = load_sync_status(&tx, id)? else {
            return Ok(MarkOutcome::Missing);
        };

        tx.execute(
            "UPDATE tasks SET
                server_id = ?1,
                server_status = ?2,
                synced_at = CASE WHEN sync_status = 'syncing' THEN ?3 ELSE synced_at END,
                conflict_resolution = CASE
                    WHEN sync_status = 'syncing' AND conflict_resolution = 'manual' AND status = ?2
                    THEN NULL ELSE conflict_resolution END,
                sync_status = CASE WHEN sync_status = 'syncing' THEN 'synced' ELSE sync_status END
             WHERE id = ?4",
            params![server_id, server_status.as_str(), now_millis(), id.as_str()],
        )?;
        tx.commit()?;

        self.notify(&conn);
        Ok(if current == SyncStatus::Syncing {
            MarkOutcome::Applied
        } else {
            MarkOutcome::Superseded
        })
    }

    /// Apply the outcome of conflict resolution and append it to the
    /// conflict log.
    ///
    /// A settled resolution marks the task `synced`; otherwise it returns to
    /// `pending_sync` with the resolution tag kept.
    pub async fn resolve_conflict(
        &self,
        id: &TaskId,
        resolved: ResolvedConflict,
    ) -> Result<MarkOutcome> {
        let ResolvedConflict {
            resolution,
            final_status,
            observed_status,
            server_status,
            settled,
        } = resolved;
        let now = now_millis();
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let current: Option<(SyncStatus, TaskStatus)> = tx
            .query_row(
                "SELECT sync_status, status FROM tasks WHERE id = ?1",
                params![id.as_str()],
                |row| Ok((parse_text(row, 0)?, parse_text(row, 1)?)),
            )
            .optional()?;
        let Some((sync_status, local_status)) = current else {
            return Ok(MarkOutcome::Missing);
        };
        if sync_status != SyncStatus::Syncing {
            return Ok(MarkOutcome::Superseded);
        }

        let next_sync_status = if settled {
            SyncStatus::Synced
        } else {
            SyncStatus::PendingSync
        };
        tx.execute(
            "UPDATE tasks SET
                status = ?1,
                server_status = ?2,
                conflict_resolution = ?3,
                updated_at = MAX(?4, updated_at),
                sync_status = ?5,
                synced_at = CASE WHEN ?6 THEN ?4 ELSE synced_at END
             WHERE id = ?7",
            params![
                final_status.as_str(),
                server_status.as_str(),
                resolution.as_str(),
                now,
                next_sync_status.as_str(),
                settled,
                id.as_str()
            ],
        )?;
        tx.execute(
            "INSERT INTO sync_conflicts
                (task_id, local_status, server_status, final_status, resolution, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.as_str(),
                local_status.as_str(),
                observed_status.as_str(),
                final_status.as_str(),
                resolution.as_str(),
                now
            ],
        )?;
        tx.commit()?;

        self.notify(&conn);
        Ok(MarkOutcome::Applied)
    }

    /// List recently resolved conflicts, newest first
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, local_status, server_status, final_status, resolution, resolved_at
             FROM sync_conflicts
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?1",
        )?;

        let conflicts = stmt
            .query_map(
                params![i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| {
                    Ok(SyncConflict {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        local_status: parse_text(row, 2)?,
                        server_status: parse_text(row, 3)?,
                        final_status: parse_text(row, 4)?,
                        resolution: parse_text(row, 5)?,
                        resolved_at: row.get(6)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    /// Deliver the current task list to subscribers.
    ///
    /// Runs while the connection is still held so deliveries happen in
    /// commit order.
    fn notify(&self, conn: &Connection) {
        if self.listeners.is_empty() {
            return;
        }
        match list_tasks(conn) {
            Ok(tasks) => self.listeners.emit(&tasks),
            Err(error) => tracing::error!("Failed to load tasks for subscribers: {error}"),
        }
    }
}

fn write_task(conn: &Connection, task: &Task, insert: bool) -> Result<()> {
    let sql = if insert {
        "INSERT INTO tasks (
            title, description, price, location_lat, location_lng, location_address,
            expires_at, status, sync_status, server_id, server_status, conflict_resolution,
            created_at, updated_at, synced_at, id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
    } else {
        "UPDATE tasks SET
            title = ?1, description = ?2, price = ?3, location_lat = ?4, location_lng = ?5,
            location_address = ?6, expires_at = ?7, status = ?8, sync_status = ?9,
            server_id = ?10, server_status = ?11, conflict_resolution = ?12,
            created_at = ?13, updated_at = ?14, synced_at = ?15
         WHERE id = ?16"
    };

    let location = task.location.as_ref();
    conn.execute(
        sql,
        params![
            task.title,
            task.description,
            task.price,
            location.map(|location| location.lat),
            location.map(|location| location.lng),
            location.and_then(|location| location.address.clone()),
            task.expires_at,
            task.status.as_str(),
            task.sync_status.as_str(),
            task.server_id,
            task.server_status.map(TaskStatus::as_str),
            task.conflict_resolution.map(ConflictResolution::as_str),
            task.created_at,
            task.updated_at,
            task.synced_at,
            task.id.as_str(),
        ],
    )?;
    Ok(())
}

fn replace_images(conn: &Connection, id: &TaskId, image_refs: &[String]) -> Result<()> {
    conn.execute(
        "DELETE FROM task_images WHERE task_id = ?1",
        params![id.as_str()],
    )?;

    let mut stmt =
        conn.prepare("INSERT INTO task_images (task_id, position, image_ref) VALUES (?1, ?2, ?3)")?;
    for (position, image_ref) in image_refs.iter().enumerate() {
        let position = i64::try_from(position)
            .map_err(|_| Error::InvalidInput("too many image references".into()))?;
        stmt.execute(params![id.as_str(), position, image_ref])?;
    }
    Ok(())
}

fn load_task(conn: &Connection, id: &TaskId) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id.as_str()],
            parse_task,
        )
        .optional()?;

    let Some(mut task) = task else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT image_ref FROM task_images WHERE task_id = ?1 ORDER BY position ASC",
    )?;
    task.image_refs = stmt
        .query_map(params![id.as_str()], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(Some(task))
}

fn load_sync_status(conn: &Connection, id: &TaskId) -> Result<Option<SyncStatus>> {
    let status = conn
        .query_row(
            "SELECT sync_status FROM tasks WHERE id = ?1",
            params![id.as_str()],
            |row| parse_text(row, 0),
        )
        .optional()?;
    Ok(status)
}

fn list_tasks(conn: &Connection) -> Result<Vec<Task>> {
    query_tasks(
        conn,
        &format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             ORDER BY updated_at DESC, created_at DESC, id DESC"
        ),
    )
}

fn query_tasks(conn: &Connection, sql: &str) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(sql)?;
    let mut tasks = stmt
        .query_map([], parse_task)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if tasks.is_empty() {
        return Ok(tasks);
    }

    let mut images = load_all_images(conn)?;
    for task in &mut tasks {
        if let Some(refs) = images.remove(&task.id.as_str()) {
            task.image_refs = refs;
        }
    }
    Ok(tasks)
}

fn load_all_images(conn: &Connection) -> Result<HashMap<String, Vec<String>>> {
    let mut stmt = conn.prepare(
        "SELECT task_id, image_ref FROM task_images ORDER BY task_id ASC, position ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut images: HashMap<String, Vec<String>> = HashMap::new();
    for row in rows {
        let (task_id, image_ref) = row?;
        images.entry(task_id).or_default().push(image_ref);
    }
    Ok(images)
}

/// Parse a task from a database row (without image references)
fn parse_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let lat: Option<f64> = row.get(4)?;
    let lng: Option<f64> = row.get(5)?;
    let location = match (lat, lng) {
        (Some(lat), Some(lng)) => Some(Location {
            lat,
            lng,
            address: row.get(6)?,
        }),
        _ => None,
    };

    Ok(Task {
        id: id
            .parse()
            .map_err(|error| conversion_error(0, Box::new(error)))?,
        title: row.get(1)?,
        description: row.get(2)?,
        price: row.get(3)?,
        location,
        image_refs: Vec::new(),
        expires_at: row.get(7)?,
        status: parse_text(row, 8)?,
        sync_status: parse_text(row, 9)?,
        server_id: row.get(10)?,
        server_status: parse_optional_text(row, 11)?,
        conflict_resolution: parse_optional_text(row, 12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        synced_at: row.get(15)?,
    })
}

fn parse_text<T: FromStr<Err = Error>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|error: Error| conversion_error(idx, Box::new(error)))
}

fn parse_optional_text<T: FromStr<Err = Error>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        raw.parse()
            .map_err(|error: Error| conversion_error(idx, Box::new(error)))
    })
    .transpose()
}

fn conversion_error(
    idx: usize,
    error: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, error)
}
