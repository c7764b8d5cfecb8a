//! SQLite persistence for the transactional outbox.
//!
//! This crate provides:
//! - The `outbox_events` schema and its migrations
//! - A synchronous `Database` for application code that writes business
//!   rows and outbox rows in one transaction
//! - An `AsyncDatabase` executor with a dedicated thread, used by the
//!   publisher's background tasks
//! - Query helpers (`queries`) that operate on any `&Connection`
//!
//! ```ignore
//! let mut db = Database::open(path)?;
//! db.transaction(|tx| {
//!     tx.execute("INSERT INTO orders (id, total) VALUES (?1, ?2)", params![id, total])?;
//!     queries::insert_event_record(tx, &record, Utc::now())?;
//!     Ok::<_, DatabaseError>(())
//! })?;
//! ```

mod db;
mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use db::Database;
pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::run_migrations;
pub use models::*;
