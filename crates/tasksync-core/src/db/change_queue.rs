//! Durable, ordered queue of remote operations.
//!
//! The queue tracks operations whose local task may already be gone, most
//! notably remote deletes. Items are processed in insertion order. Every
//! mutation addresses a single row by its sequence number, so an enqueue from
//! the delete path can interleave with a drain without losing either write.

use std::future::Future;

use rusqlite::{params, Connection, Row};

use super::Database;
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::models::{now_millis, DeadLetter, NewQueueItem, QueueItem};
use crate::error::compact_detail;

/// Default number of non-connectivity failures before an item is dead-lettered
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

const QUEUE_COLUMNS: &str = "seq, task_id, action, timestamp, data, attempts, last_error";

/// Why a processor could not complete a queue item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The remote could not be reached; retry on the next drain
    Unreachable,
    /// Any other failure; counts against the item's retry budget
    Failed(String),
}

/// Counts from one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Completed and removed
    pub processed: usize,
    /// Kept because the remote was unreachable
    pub retained: usize,
    /// Kept after a non-connectivity failure
    pub failed: usize,
    /// Moved to the dead-letter table
    pub dead_lettered: usize,
    /// Not attempted because the device went offline mid-drain
    pub skipped: usize,
}

/// Durable change queue backed by the `change_queue` table
#[derive(Clone)]
pub struct ChangeQueue {
    db: Database,
    max_attempts: u32,
}

impl ChangeQueue {
    pub const fn new(db: Database) -> Self {
        Self {
            db,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Queue using the dead-letter budget from `settings`
    pub fn from_settings(db: Database, settings: &SyncSettings) -> Self {
        Self::new(db).with_max_attempts(settings.max_queue_attempts)
    }

    /// Set the retry budget for non-connectivity failures (minimum 1)
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Durably append an item
    pub async fn enqueue(&self, item: NewQueueItem) -> Result<QueueItem> {
        let conn = self.db.lock().await;
        let seq = insert_item(&conn, &item)?;
        tracing::debug!(seq, action = %item.action, task_id = %item.task_id, "Queued remote operation");

        Ok(QueueItem {
            seq,
            task_id: item.task_id,
            action: item.action,
            timestamp: item.timestamp,
            data: item.data,
            attempts: 0,
            last_error: None,
        })
    }

    /// All live items in processing order
    pub async fn items(&self) -> Result<Vec<QueueItem>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM change_queue ORDER BY seq ASC"
        ))?;
        let items = stmt
            .query_map([], parse_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    pub async fn len(&self) -> Result<usize> {
        let conn = self.db.lock().await;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM change_queue", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Process every queued item in insertion order.
    ///
    /// Successful items are removed. Items the processor reports as
    /// unreachable stay where they are. Other failures are logged, counted
    /// against the item, and dead-lettered once the budget is spent.
    /// `is_online` is checked before each item; going offline stops the pass.
    pub async fn drain<P, Fut>(
        &self,
        is_online: impl Fn() -> bool,
        mut processor: P,
    ) -> Result<DrainReport>
    where
        P: FnMut(QueueItem) -> Fut,
        Fut: Future<Output = std::result::Result<(), ProcessError>>,
    {
        let items = self.items().await?;
        let total = items.len();
        let mut report = DrainReport::default();

        for (index, item) in items.into_iter().enumerate() {
            if !is_online() {
                report.skipped = total - index;
                tracing::debug!(remaining = report.skipped, "Went offline, stopping queue drain");
                break;
            }

            let seq = item.seq;
            match processor(item.clone()).await {
                Ok(()) => {
                    self.remove(seq).await?;
                    report.processed += 1;
                }
                Err(ProcessError::Unreachable) => {
                    tracing::debug!(seq, "Remote unreachable, keeping queue item");
                    report.retained += 1;
                }
                Err(ProcessError::Failed(message)) => {
                    if self.record_failure(&item, &message).await? {
                        report.dead_lettered += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        if report != DrainReport::default() {
            tracing::info!(
                processed = report.processed,
                retained = report.retained,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                skipped = report.skipped,
                "Drained change queue"
            );
        }
        Ok(report)
    }

    /// Items that exhausted their retry budget, most recent first
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, original_seq, task_id, action, timestamp, data, attempts, last_error, failed_at
             FROM dead_letter_queue
             ORDER BY failed_at DESC, id DESC",
        )?;
        let letters = stmt
            .query_map([], |row| {
                Ok(DeadLetter {
                    id: row.get(0)?,
                    original_seq: row.get(1)?,
                    task_id: row.get(2)?,
                    action: parse_action(row, 3)?,
                    timestamp: row.get(4)?,
                    data: row.get(5)?,
                    attempts: row.get(6)?,
                    last_error: row.get(7)?,
                    failed_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(letters)
    }

    /// Move a dead letter back to the tail of the live queue with a fresh
    /// retry budget
    pub async fn requeue_dead_letter(&self, id: i64) -> Result<QueueItem> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let letter = tx
            .query_row(
                "SELECT task_id, action, timestamp, data FROM dead_letter_queue WHERE id = ?1",
                params![id],
                |row| {
                    Ok(NewQueueItem {
                        task_id: row.get(0)?,
                        action: parse_action(row, 1)?,
                        timestamp: row.get(2)?,
                        data: row.get(3)?,
                    })
                },
            )
            .map_err(|error| match error {
                rusqlite::Error::QueryReturnedNoRows => {
                    Error::NotFound(format!("dead letter {id}"))
                }
                other => other.into(),
            })?;

        let seq = insert_item(&tx, &letter)?;
        tx.execute("DELETE FROM dead_letter_queue WHERE id = ?1", params![id])?;
        tx.commit()?;

        tracing::info!(id, seq, "Requeued dead-lettered operation");
        Ok(QueueItem {
            seq,
            task_id: letter.task_id,
            action: letter.action,
            timestamp: letter.timestamp,
            data: letter.data,
            attempts: 0,
            last_error: None,
        })
    }

    /// Drop every dead letter; returns how many were removed
    pub async fn clear_dead_letters(&self) -> Result<usize> {
        let conn = self.db.lock().await;
        Ok(conn.execute("DELETE FROM dead_letter_queue", [])?)
    }

    async fn remove(&self, seq: i64) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute("DELETE FROM change_queue WHERE seq = ?1", params![seq])?;
        Ok(())
    }

    /// Count a failure against an item. Returns `true` if it was dead-lettered.
    async fn record_failure(&self, item: &QueueItem, message: &str) -> Result<bool> {
        let message = compact_detail(message);
        let attempts = item.attempts.saturating_add(1);

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let exhausted = attempts >= self.max_attempts;
        if exhausted {
            tx.execute(
                "INSERT INTO dead_letter_queue
                    (original_seq, task_id, action, timestamp, data, attempts, last_error, failed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    item.seq,
                    item.task_id,
                    item.action.as_str(),
                    item.timestamp,
                    item.data,
                    attempts,
                    message,
                    now_millis()
                ],
            )?;
            tx.execute("DELETE FROM change_queue WHERE seq = ?1", params![item.seq])?;
        } else {
            tx.execute(
                "UPDATE change_queue SET attempts = ?1, last_error = ?2 WHERE seq = ?3",
                params![attempts, message, item.seq],
            )?;
        }
        tx.commit()?;

        if exhausted {
            tracing::warn!(
                seq = item.seq,
                action = %item.action,
                task_id = %item.task_id,
                attempts,
                "Queue item failed permanently, moved to dead-letter queue: {message}"
            );
        } else {
            tracing::warn!(
                seq = item.seq,
                action = %item.action,
                task_id = %item.task_id,
                attempts,
                max_attempts = self.max_attempts,
                "Queue item failed, will retry: {message}"
            );
        }
        Ok(exhausted)
    }
}

/// Append an item using an existing connection or transaction
pub(crate) fn insert_item(conn: &Connection, item: &NewQueueItem) -> Result<i64> {
    conn.execute(
        "INSERT INTO change_queue (task_id, action, timestamp, data) VALUES (?1, ?2, ?3, ?4)",
        params![item.task_id, item.action.as_str(), item.timestamp, item.data],
    )?;
    Ok(conn.last_insert_rowid())
}

fn parse_item(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        seq: row.get(0)?,
        task_id: row.get(1)?,
        action: parse_action(row, 2)?,
        timestamp: row.get(3)?,
        data: row.get(4)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
    })
}

fn parse_action(row: &Row<'_>, idx: usize) -> rusqlite::Result<crate::models::QueueAction> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|error: Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(error))
    })
}
