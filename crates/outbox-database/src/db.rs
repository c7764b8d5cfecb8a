//! Synchronous database handle.
//!
//! Application code that owns its own connection writes business rows and
//! outbox rows through this type, inside a single `transaction`.

use crate::{migrations, DatabaseResult};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use tracing::debug;

/// Database wrapper around a single rusqlite connection.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path, running migrations if needed.
    pub fn open(path: &Path) -> DatabaseResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        migrations::run_migrations(&conn)?;
        debug!(path = %path.display(), "Database opened");

        Ok(Self { conn })
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        // Note: WAL mode doesn't apply to in-memory databases
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get a mutable reference to the underlying connection.
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Run `f` inside an immediate transaction.
    ///
    /// Commits when `f` returns `Ok`. Any error rolls back every write made
    /// through the transaction, business rows and outbox rows alike, and is
    /// returned to the caller unchanged.
    pub fn transaction<F, T, E>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Dropping an uncommitted transaction rolls it back.
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
