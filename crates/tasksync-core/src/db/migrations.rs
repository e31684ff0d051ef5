//! Database migrations
//!
//! Migrations are additive only. Columns are added through
//! [`add_column_if_missing`] so that an installation which already has a
//! column (for example from an interrupted upgrade) migrates cleanly.

use rusqlite::{Connection, Transaction};

use crate::error::Result;

/// Current schema version
pub const CURRENT_VERSION: i32 = 4;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = current_version(conn)?;

    if version < 1 {
        apply(conn, 1, migrate_v1)?;
    }
    if version < 2 {
        apply(conn, 2, migrate_v2)?;
    }
    if version < 3 {
        apply(conn, 3, migrate_v3)?;
    }
    if version < 4 {
        apply(conn, 4, migrate_v4)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn current_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Run one migration step inside a transaction and record its version
fn apply(
    conn: &mut Connection,
    version: i32,
    step: fn(&Transaction<'_>) -> Result<()>,
) -> Result<()> {
    let tx = conn.transaction()?;
    step(&tx)?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Add a column unless the table already has it
pub(crate) fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<bool> {
    if has_column(conn, table, column)? {
        return Ok(false);
    }
    conn.execute_batch(&format!(
        "ALTER TABLE {table} ADD COLUMN {column} {definition}"
    ))?;
    Ok(true)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|name| name == column))
}

/// Migration to version 1: Initial schema
fn migrate_v1(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            price REAL,
            location_lat REAL,
            location_lng REAL,
            location_address TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            sync_status TEXT NOT NULL DEFAULT 'pending_sync',
            server_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_updated ON tasks(updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_tasks_sync_status ON tasks(sync_status);
        CREATE TABLE IF NOT EXISTS task_images (
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            image_ref TEXT NOT NULL,
            PRIMARY KEY (task_id, position)
        );",
    )?;
    Ok(())
}

/// Migration to version 2: Sync metadata, expiry, and conflict log
fn migrate_v2(tx: &Transaction<'_>) -> Result<()> {
    add_column_if_missing(tx, "tasks", "expires_at", "INTEGER")?;
    add_column_if_missing(tx, "tasks", "server_status", "TEXT")?;
    add_column_if_missing(tx, "tasks", "conflict_resolution", "TEXT")?;
    add_column_if_missing(tx, "tasks", "synced_at", "INTEGER")?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            local_status TEXT NOT NULL,
            server_status TEXT NOT NULL,
            final_status TEXT NOT NULL,
            resolution TEXT NOT NULL,
            resolved_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_task_id ON sync_conflicts(task_id);
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC);",
    )?;
    Ok(())
}

/// Migration to version 3: Durable change queue
fn migrate_v3(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS change_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            action TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            data TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );",
    )?;
    Ok(())
}

/// Migration to version 4: Dead-letter storage for exhausted queue items
fn migrate_v4(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS dead_letter_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            original_seq INTEGER NOT NULL,
            task_id TEXT NOT NULL,
            action TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            data TEXT,
            attempts INTEGER NOT NULL,
            last_error TEXT NOT NULL,
            failed_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_dead_letter_failed_at ON dead_letter_queue(failed_at DESC);",
    )?;
    Ok(())
}
