//! The outbox publisher.
//!
//! Three duties share one `OutboxPublisher`:
//!
//! - **Storage**: `store` / `store_batch` insert outbox rows on the caller's
//!   connection, inside the caller's transaction. No broker I/O happens here.
//! - **Dispatch**: a background loop selects ready rows, publishes them per
//!   topic and records the outcome.
//! - **Cleanup**: a slower background loop deletes published rows past the
//!   retention age.
//!
//! Delivery is at-least-once. Outcomes are committed after the broker calls
//! return, so a crash between a broker ack and that commit re-publishes the
//! batch on the next tick. Consumers deduplicate on the `event_id` header.
//!
//! Only one dispatch loop may run against a table. `start` is idempotent
//! within a process; running several processes against one database is not
//! supported.

use crate::broker::{message_headers, BrokerHandle};
use crate::health::{DispatchReport, HealthReport, HealthStatus, PublisherStatus};
use crate::{BrokerError, DomainEvent, OutboxConfig, OutboxError, OutboxResult};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use outbox_database::{queries, AsyncDatabase, EventRecord};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// State shared between the handle and its background tasks.
struct Shared {
    db: AsyncDatabase,
    broker: BrokerHandle,
    config: OutboxConfig,
    /// Held for a whole dispatch tick, selection through commit, so
    /// overlapping ticks never select the same rows.
    dispatch_guard: tokio::sync::Mutex<()>,
    last_dispatch_at: Mutex<Option<DateTime<Utc>>>,
    last_cleanup_at: Mutex<Option<DateTime<Utc>>>,
}

/// Running loops. Dropping this drops the shutdown sender, which also ends
/// both loops.
struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

/// Transactional outbox publisher.
///
/// Construct one per process and share it (e.g. in an `Arc`).
pub struct OutboxPublisher {
    shared: Arc<Shared>,
    tasks: tokio::sync::Mutex<Option<BackgroundTasks>>,
}

impl OutboxPublisher {
    /// Create a publisher over `db` and `broker`.
    ///
    /// Fails if `config` does not validate.
    pub fn new(db: AsyncDatabase, broker: BrokerHandle, config: OutboxConfig) -> OutboxResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                db,
                broker,
                config,
                dispatch_guard: tokio::sync::Mutex::new(()),
                last_dispatch_at: Mutex::new(None),
                last_cleanup_at: Mutex::new(None),
            }),
            tasks: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.shared.config
    }

    // ==========================================
    // Storage
    // ==========================================

    /// Write `event` to the outbox on the caller's connection.
    ///
    /// Pass the caller's open transaction; the row commits or rolls back with
    /// it. On error the caller must roll back. Returns the new record id.
    pub fn store(&self, conn: &Connection, event: &DomainEvent) -> OutboxResult<String> {
        let record = event.to_new_record(Uuid::new_v4().to_string())?;
        queries::insert_event_record(conn, &record, Utc::now())?;
        debug!(
            event_id = %record.id,
            event_type = %record.event_type,
            topic = %record.topic,
            "Stored outbox event"
        );
        Ok(record.id)
    }

    /// Write several events on the caller's connection, in order.
    pub fn store_batch(&self, conn: &Connection, events: &[DomainEvent]) -> OutboxResult<Vec<String>> {
        let records = events
            .iter()
            .map(|event| event.to_new_record(Uuid::new_v4().to_string()))
            .collect::<OutboxResult<Vec<_>>>()?;

        queries::insert_event_records(conn, &records, Utc::now())?;
        debug!(count = records.len(), "Stored outbox events");
        Ok(records.into_iter().map(|r| r.id).collect())
    }

    // ==========================================
    // Dispatch & cleanup
    // ==========================================

    /// Run one dispatch tick.
    ///
    /// Waits for any tick already in progress, including the background
    /// loop's, so each ready record is published at most once per round.
    pub async fn dispatch_once(&self) -> OutboxResult<DispatchReport> {
        self.shared.dispatch_once().await
    }

    /// Run one cleanup pass. Returns the number of deleted records.
    pub async fn cleanup_once(&self) -> OutboxResult<usize> {
        self.shared.cleanup_once().await
    }

    // ==========================================
    // Lifecycle
    // ==========================================

    /// Spawn the dispatch and cleanup loops. No-op if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            warn!("Outbox publisher already running");
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatch = tokio::spawn(run_dispatch_loop(self.shared.clone(), shutdown_rx.clone()));
        let cleanup = tokio::spawn(run_cleanup_loop(self.shared.clone(), shutdown_rx));

        *tasks = Some(BackgroundTasks {
            shutdown,
            dispatch,
            cleanup,
        });

        info!(
            poll_interval_secs = self.shared.config.poll_interval_secs,
            batch_size = self.shared.config.batch_size,
            max_retries = self.shared.config.max_retries,
            "Outbox publisher started"
        );
    }

    /// Stop both loops and wait for them to exit. No-op if not running.
    ///
    /// An in-flight iteration finishes, including its commit.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            debug!("Outbox publisher not running");
            return;
        };

        let _ = tasks.shutdown.send(true);
        for (task, handle) in [("dispatch", tasks.dispatch), ("cleanup", tasks.cleanup)] {
            if let Err(e) = handle.await {
                error!(task, error = %e, "Outbox background task ended abnormally");
            }
        }

        info!("Outbox publisher stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.dispatch.is_finished() && !t.cleanup.is_finished())
    }

    // ==========================================
    // Status & health
    // ==========================================

    pub async fn status(&self) -> OutboxResult<PublisherStatus> {
        let config = &self.shared.config;
        let max_retries = config.max_retries;

        let (pending_events, failed_events, published_events) = self
            .shared
            .db
            .call(move |conn| {
                Ok((
                    queries::count_pending(conn)?,
                    queries::count_exhausted(conn, max_retries)?,
                    queries::count_published(conn)?,
                ))
            })
            .await?;

        Ok(PublisherStatus {
            is_running: self.is_running().await,
            pending_events,
            failed_events,
            published_events,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval_secs,
            max_retries,
            last_dispatch_at: *self.shared.last_dispatch_at.lock(),
            last_cleanup_at: *self.shared.last_cleanup_at.lock(),
        })
    }

    /// Summarize operational health.
    ///
    /// Unhealthy when stopped or when the store cannot be queried. Degraded
    /// when the exhausted or pending count passes its threshold.
    pub async fn health_check(&self) -> HealthReport {
        let config = &self.shared.config;
        let mut errors = Vec::new();
        let mut unhealthy = false;

        if !self.is_running().await {
            errors.push("publisher is not running".to_string());
            unhealthy = true;
        }

        match self.status().await {
            Ok(status) => {
                if status.failed_events > config.degraded_failed_threshold {
                    errors.push(format!(
                        "{} events exhausted their retries (threshold {})",
                        status.failed_events, config.degraded_failed_threshold
                    ));
                }
                if status.pending_events > config.degraded_pending_threshold {
                    errors.push(format!(
                        "{} events pending (threshold {})",
                        status.pending_events, config.degraded_pending_threshold
                    ));
                }
            }
            Err(e) => {
                errors.push(format!("outbox store unavailable: {}", e));
                unhealthy = true;
            }
        }

        let status = if unhealthy {
            HealthStatus::Unhealthy
        } else if !errors.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport { status, errors }
    }

    /// Records that reached the retry ceiling, oldest first.
    pub async fn exhausted_events(&self, limit: usize) -> OutboxResult<Vec<EventRecord>> {
        let max_retries = self.shared.config.max_retries;
        let records = self
            .shared
            .db
            .call(move |conn| queries::list_exhausted(conn, max_retries, limit))
            .await?;
        Ok(records)
    }
}

impl Shared {
    async fn dispatch_once(&self) -> OutboxResult<DispatchReport> {
        let _guard = self.dispatch_guard.lock().await;

        let batch_size = self.config.batch_size;
        let max_retries = self.config.max_retries;
        let retry_delay = self.config.retry_delay();
        let selected_at = Utc::now();

        let records = self
            .db
            .call(move |conn| {
                queries::select_ready(conn, batch_size, max_retries, retry_delay, selected_at)
            })
            .await?;
        *self.last_dispatch_at.lock() = Some(selected_at);

        if records.is_empty() {
            return Ok(DispatchReport::default());
        }

        let selected = records.len();
        let groups = group_by_topic(records);
        let topics: Vec<String> = groups.iter().map(|(topic, _)| topic.clone()).collect();

        let mut published_ids = Vec::new();
        let mut failures: Vec<(Vec<String>, String)> = Vec::new();
        let mut exhausted: Vec<(String, String)> = Vec::new();

        for (topic, group) in &groups {
            let ids: Vec<String> = group.iter().map(|r| r.id.clone()).collect();
            match self.publish_group(topic, group).await {
                Ok(()) => {
                    debug!(topic = %topic, count = ids.len(), "Published topic group");
                    published_ids.extend(ids);
                }
                Err(e) => {
                    warn!(topic = %topic, count = ids.len(), error = %e, "Topic group dispatch failed");
                    exhausted.extend(
                        group
                            .iter()
                            .filter(|r| r.retry_count + 1 >= max_retries)
                            .map(|r| (r.id.clone(), topic.clone())),
                    );
                    failures.push((ids, e.to_string()));
                }
            }
        }

        let marked_at = Utc::now();
        let (published, failed) = self
            .db
            .transaction(move |tx| {
                let published = queries::mark_published(tx, &published_ids, marked_at)?;
                let mut failed = 0;
                for (ids, reason) in &failures {
                    failed += queries::mark_failed(tx, ids, reason, marked_at)?;
                }
                Ok((published, failed))
            })
            .await?;

        for (event_id, topic) in &exhausted {
            error!(
                event_id = %event_id,
                topic = %topic,
                max_retries,
                "Outbox event exhausted its retries; manual intervention required"
            );
        }

        Ok(DispatchReport {
            selected,
            published,
            failed,
            topics,
        })
    }

    /// Publish one topic group, bounded by the broker timeout.
    async fn publish_group(&self, topic: &str, records: &[EventRecord]) -> OutboxResult<()> {
        let messages: Vec<Vec<u8>> = records.iter().map(|r| r.payload.as_bytes().to_vec()).collect();
        let keys: Vec<String> = records.iter().map(|r| r.partition_key.clone()).collect();
        let headers: Vec<HashMap<String, String>> = records.iter().map(message_headers).collect();

        let timeout = self.config.broker_timeout();
        let publish = self.broker.publish_batch(topic, &messages, &keys, &headers);

        let result = match tokio::time::timeout(timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(timeout)),
        };

        result.map_err(|source| OutboxError::Dispatch {
            topic: topic.to_string(),
            source,
        })
    }

    async fn cleanup_once(&self) -> OutboxResult<usize> {
        let now = Utc::now();
        let cutoff = now - self.config.cleanup_age();

        let deleted = self
            .db
            .call(move |conn| queries::delete_published_older_than(conn, cutoff))
            .await?;
        *self.last_cleanup_at.lock() = Some(now);

        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Cleaned up published outbox events");
        } else {
            debug!(cutoff = %cutoff, "No published outbox events to clean up");
        }
        Ok(deleted)
    }
}

/// Group records by topic, keeping first-seen topic order and record order
/// within each topic.
fn group_by_topic(records: Vec<EventRecord>) -> Vec<(String, Vec<EventRecord>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<EventRecord>)> = Vec::new();

    for record in records {
        match index.get(&record.topic) {
            Some(&i) => groups[i].1.push(record),
            None => {
                index.insert(record.topic.clone(), groups.len());
                groups.push((record.topic.clone(), vec![record]));
            }
        }
    }
    groups
}

async fn run_dispatch_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(shared.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        match AssertUnwindSafe(shared.dispatch_once()).catch_unwind().await {
            Ok(Ok(report)) if !report.is_empty() => {
                info!(
                    selected = report.selected,
                    published = report.published,
                    failed = report.failed,
                    "Dispatch tick complete"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Dispatch tick failed; retrying next tick"),
            Err(_) => error!("Dispatch tick panicked; retrying next tick"),
        }
    }

    debug!("Dispatch loop exited");
}

async fn run_cleanup_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(shared.config.cleanup_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        match AssertUnwindSafe(shared.cleanup_once()).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Cleanup failed; retrying next interval"),
            Err(_) => error!("Cleanup panicked; retrying next interval"),
        }
    }

    debug!("Cleanup loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, topic: &str) -> EventRecord {
        let now = Utc::now();
        EventRecord {
            id: id.to_string(),
            aggregate_id: "agg".to_string(),
            aggregate_type: "Order".to_string(),
            event_type: "OrderPlaced".to_string(),
            event_version: 1,
            payload: "{}".to_string(),
            correlation_id: None,
            causation_id: None,
            user_id: None,
            topic: topic.to_string(),
            partition_key: "agg".to_string(),
            processed: false,
            processed_at: None,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_group_by_topic_is_stable() {
        let records = vec![
            record("1", "orders"),
            record("2", "payments"),
            record("3", "orders"),
            record("4", "shipping"),
            record("5", "payments"),
        ];

        let groups = group_by_topic(records);
        let shape: Vec<(&str, Vec<&str>)> = groups
            .iter()
            .map(|(t, rs)| (t.as_str(), rs.iter().map(|r| r.id.as_str()).collect()))
            .collect();

        assert_eq!(
            shape,
            vec![
                ("orders", vec!["1", "3"]),
                ("payments", vec!["2", "5"]),
                ("shipping", vec!["4"]),
            ]
        );
    }

    #[test]
    fn test_group_by_topic_empty() {
        assert!(group_by_topic(Vec::new()).is_empty());
    }
}
