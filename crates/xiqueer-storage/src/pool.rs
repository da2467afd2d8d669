//! The store's single SQLite connection.
//!
//! Captures arrive from many proxy connection tasks at once while the CLI may
//! be reading the same file. All access goes through one mutex-guarded
//! connection, and every write runs in an `IMMEDIATE` transaction so two
//! captures of the same week resolve to one row.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::warn;

use crate::error::Result;
use crate::schema::run_migrations;

/// How long a statement waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the store's connection.
#[derive(Clone)]
pub struct ConnectionPool {
    conn: Arc<Mutex<Connection>>,
    journal_mode: Arc<str>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("journal_mode", &self.journal_mode)
            .finish()
    }
}

impl ConnectionPool {
    /// Opens (creating if needed) the database file and its parent directory.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// A private in-memory store.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let journal_mode = configure(&conn)?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            journal_mode: journal_mode.into(),
        })
    }

    /// Journal mode SQLite settled on: `wal` for files, `memory` in memory.
    pub fn journal_mode(&self) -> &str {
        &self.journal_mode
    }

    /// Runs read-only work on the connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&*conn)
    }

    /// Runs `f` in an `IMMEDIATE` transaction, committing only if it succeeds.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic inside `write` drops its transaction, which rolls back, so
        // the connection is still consistent.
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("Recovering store connection after a panic");
            poisoned.into_inner()
        })
    }
}

/// Applies pragmas and returns the journal mode in effect.
fn configure(conn: &Connection) -> Result<String> {
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !journal_mode.eq_ignore_ascii_case("wal") && journal_mode != "memory" {
        warn!("Store is running in {} journal mode", journal_mode);
    }

    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    Ok(journal_mode.to_ascii_lowercase())
}
