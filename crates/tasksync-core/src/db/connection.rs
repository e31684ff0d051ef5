//! Database connection management

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard};

use super::migrations;
use crate::error::Result;

/// Shared handle to the local `SQLite` database.
///
/// The task store and the change queue hold clones of the same handle, so
/// every read-modify-write they perform is serialized through one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open a database at the given path, creating it (and its parent
    /// directory) if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(&path)?;
        configure(&conn, true)?;
        migrations::run(&mut conn)?;
        tracing::debug!("Opened task database at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        configure(&conn, false)?;
        migrations::run(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Filesystem location, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current schema version
    pub async fn schema_version(&self) -> Result<i32> {
        let conn = self.lock().await;
        migrations::current_version(&conn)
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

/// Configure `SQLite` pragmas
fn configure(conn: &Connection, on_disk: bool) -> Result<()> {
    if on_disk {
        // WAL returns the resulting mode as a row
        conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;
    }
    // Every committed write must survive a crash, not just an app exit
    conn.execute_batch(
        "PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}
