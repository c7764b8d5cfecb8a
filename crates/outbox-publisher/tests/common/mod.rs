//! Test harness for outbox publisher integration tests.
//!
//! Provides:
//! - TestHarness: an on-disk SQLite database opened twice (sync for business
//!   code, async for the publisher), an InMemoryBroker and a publisher
//! - Helpers to store events in committed or rolled-back transactions

#![allow(dead_code)]

use outbox_database::queries;
use outbox_publisher::{
    AsyncDatabase, Database, DomainEvent, EventRecord, InMemoryBroker, OutboxConfig,
    OutboxPublisher,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub struct TestHarness {
    pub db: Database,
    pub async_db: AsyncDatabase,
    pub broker: InMemoryBroker,
    pub publisher: OutboxPublisher,
    _temp_dir: TempDir,
}

impl TestHarness {
    pub async fn new(config: OutboxConfig) -> Self {
        init_logging(&config);
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("outbox.db");

        let db = Database::open(&path).unwrap();
        db.connection()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS orders (
                    id TEXT PRIMARY KEY,
                    total INTEGER NOT NULL
                )",
            )
            .unwrap();

        let async_db = AsyncDatabase::open(&path).await.unwrap();
        let broker = InMemoryBroker::new();
        let publisher =
            OutboxPublisher::new(async_db.clone(), Arc::new(broker.clone()), config).unwrap();

        Self {
            db,
            async_db,
            broker,
            publisher,
            _temp_dir: temp_dir,
        }
    }

    pub async fn with_defaults() -> Self {
        Self::new(OutboxConfig::default()).await
    }

    /// Store events alongside an order row and commit.
    pub fn store_committed(&mut self, events: &[DomainEvent]) -> Vec<String> {
        let publisher = &self.publisher;
        self.db
            .transaction(|tx| {
                let order_id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO orders (id, total) VALUES (?1, 100)",
                    [&order_id],
                )?;
                publisher.store_batch(tx, events)
            })
            .unwrap()
    }

    pub fn record(&self, id: &str) -> Option<EventRecord> {
        queries::get_event_record(self.db.connection(), id).unwrap()
    }

    pub fn order_count(&self) -> i64 {
        self.db
            .connection()
            .query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            .unwrap()
    }

    /// Poll until the broker has accepted `count` messages.
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.broker.published_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.broker.published_count() >= count
    }
}

/// Install a test subscriber once per binary; later calls are no-ops.
fn init_logging(config: &OutboxConfig) {
    let log_config = OutboxConfig {
        log_level: "debug".to_string(),
        ..config.clone()
    }
    .log_config("outbox-publisher-tests");
    let _ = observability::init_with_config(log_config);
}

pub fn order_event(order_id: &str) -> DomainEvent {
    DomainEvent::new("Order", order_id, "OrderPlaced", json!({"order_id": order_id, "total": 100}))
        .with_topic("orders")
}

pub fn payment_event(order_id: &str) -> DomainEvent {
    DomainEvent::new("Payment", order_id, "PaymentCaptured", json!({"order_id": order_id}))
        .with_topic("payments")
}

/// Config with no retry delay so failed records are immediately eligible.
pub fn fast_config() -> OutboxConfig {
    OutboxConfig {
        retry_delay_secs: 0,
        ..Default::default()
    }
}
