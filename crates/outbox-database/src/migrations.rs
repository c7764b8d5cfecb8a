//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Schema up to date");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_events(conn)?;
    }
    if current_version < 2 {
        migrate_v2_cleanup_index(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: Outbox event table.
///
/// Timestamps are fixed-width RFC 3339 strings, so text comparison matches
/// chronological order.
fn migrate_v1_outbox_events(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: outbox events");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_events (
            id TEXT PRIMARY KEY,
            aggregate_id TEXT NOT NULL,
            aggregate_type TEXT NOT NULL,
            event_type TEXT NOT NULL,
            event_version INTEGER NOT NULL DEFAULT 1,
            payload TEXT NOT NULL,
            correlation_id TEXT,
            causation_id TEXT,
            user_id TEXT,
            topic TEXT NOT NULL,
            partition_key TEXT NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            processed_at TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_events_ready
            ON outbox_events(processed, created_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_events_retry
            ON outbox_events(processed, retry_count);
        CREATE INDEX IF NOT EXISTS idx_outbox_events_aggregate
            ON outbox_events(aggregate_type, aggregate_id);
        ",
    )?;

    record_migration(conn, 1, "outbox_events")?;
    Ok(())
}

/// V2: Index backing retention cleanup.
fn migrate_v2_cleanup_index(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: cleanup index");

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_outbox_events_processed_at
            ON outbox_events(processed, processed_at);
        ",
    )?;

    record_migration(conn, 2, "outbox_events_cleanup_index")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_migrations_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM outbox_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_run_migrations_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, CURRENT_VERSION as i64);
    }
}
