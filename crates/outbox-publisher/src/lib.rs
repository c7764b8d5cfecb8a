//! # Outbox Publisher
//!
//! Transactional outbox for SQLite-backed services: domain events are
//! written in the same transaction as the business change that produced
//! them, then forwarded to a message broker by a background loop.
//!
//! ## Architecture
//!
//! ```text
//! business tx ──store()──▶ outbox_events ──dispatch loop──▶ Broker
//!                               │
//!                         cleanup loop (deletes published rows)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let config = OutboxConfig::from_env();
//! observability::init_with_config(config.log_config("orders-service"))?;
//!
//! let db = AsyncDatabase::open(&path).await?;
//! let publisher = Arc::new(OutboxPublisher::new(db, broker, config)?);
//! publisher.start().await;
//!
//! // In business code, on the application's own connection:
//! let tx = conn.transaction()?;
//! tx.execute("UPDATE orders SET status = 'placed' WHERE id = ?1", [&order_id])?;
//! publisher.store(&tx, &DomainEvent::new("Order", &order_id, "OrderPlaced", payload))?;
//! tx.commit()?;
//! ```

mod broker;
mod config;
mod error;
mod event;
mod health;
mod publisher;

pub use broker::{message_headers, Broker, BrokerHandle, InMemoryBroker, PublishedBatch};
pub use config::{OutboxConfig, DEFAULT_LOG_LEVEL};
pub use error::{BrokerError, OutboxError, OutboxResult};
pub use event::DomainEvent;
pub use health::{DispatchReport, HealthReport, HealthStatus, PublisherStatus};
pub use publisher::OutboxPublisher;

pub use observability::LogConfig;
pub use outbox_database::{AsyncDatabase, Database, EventRecord, RecordState};
