//! Broker port.
//!
//! The publisher talks to a message broker only through [`Broker`]. Each
//! call publishes one topic group and must succeed or fail as a whole.

use crate::BrokerError;
use async_trait::async_trait;
use outbox_database::EventRecord;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Batched, topic-addressed, keyed publish.
///
/// `messages`, `keys` and `headers` are parallel slices of equal length.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish_batch(
        &self,
        topic: &str,
        messages: &[Vec<u8>],
        keys: &[String],
        headers: &[HashMap<String, String>],
    ) -> Result<(), BrokerError>;
}

/// Shared broker handle.
pub type BrokerHandle = Arc<dyn Broker>;

/// Per-message headers for an outbox record.
pub fn message_headers(record: &EventRecord) -> HashMap<String, String> {
    let mut headers = HashMap::with_capacity(8);
    headers.insert("event_id".to_string(), record.id.clone());
    headers.insert("event_type".to_string(), record.event_type.clone());
    headers.insert("event_version".to_string(), record.event_version.to_string());
    headers.insert("aggregate_type".to_string(), record.aggregate_type.clone());
    headers.insert("aggregate_id".to_string(), record.aggregate_id.clone());

    let optional = [
        ("correlation_id", &record.correlation_id),
        ("causation_id", &record.causation_id),
        ("user_id", &record.user_id),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            headers.insert(key.to_string(), value.clone());
        }
    }
    headers
}

/// A batch accepted by [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct PublishedBatch {
    pub topic: String,
    pub messages: Vec<Vec<u8>>,
    pub keys: Vec<String>,
    pub headers: Vec<HashMap<String, String>>,
}

impl PublishedBatch {
    /// Event ids in publish order, taken from the `event_id` header.
    pub fn event_ids(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter_map(|h| h.get("event_id").cloned())
            .collect()
    }
}

#[derive(Default)]
struct InMemoryState {
    batches: Vec<PublishedBatch>,
    failing_topics: HashSet<String>,
    fail_all: bool,
    hang: bool,
    delay: Option<Duration>,
    attempts: usize,
}

/// Broker that keeps published batches in memory.
///
/// Used by tests and local development. Failures and hangs can be switched
/// on per topic or globally.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every publish to `topic` until [`recover_topic`](Self::recover_topic).
    pub fn fail_topic(&self, topic: &str) {
        self.state.lock().failing_topics.insert(topic.to_string());
    }

    pub fn recover_topic(&self, topic: &str) {
        self.state.lock().failing_topics.remove(topic);
    }

    /// Report every publish as unavailable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().fail_all = unavailable;
    }

    /// Never complete publish calls.
    pub fn set_hang(&self, hang: bool) {
        self.state.lock().hang = hang;
    }

    /// Sleep for `delay` before answering each publish call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    /// All accepted batches, oldest first.
    pub fn batches(&self) -> Vec<PublishedBatch> {
        self.state.lock().batches.clone()
    }

    /// Accepted batches for one topic.
    pub fn batches_for(&self, topic: &str) -> Vec<PublishedBatch> {
        self.state
            .lock()
            .batches
            .iter()
            .filter(|b| b.topic == topic)
            .cloned()
            .collect()
    }

    /// Total number of accepted messages.
    pub fn published_count(&self) -> usize {
        self.state.lock().batches.iter().map(|b| b.messages.len()).sum()
    }

    /// Number of publish calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish_batch(
        &self,
        topic: &str,
        messages: &[Vec<u8>],
        keys: &[String],
        headers: &[HashMap<String, String>],
    ) -> Result<(), BrokerError> {
        let (outcome, hang, delay) = {
            let mut state = self.state.lock();
            state.attempts += 1;

            let outcome = if state.fail_all {
                Err(BrokerError::Unavailable("in-memory broker offline".to_string()))
            } else if state.failing_topics.contains(topic) {
                Err(BrokerError::Rejected(format!("topic {} is failing", topic)))
            } else if messages.len() != keys.len() || messages.len() != headers.len() {
                Err(BrokerError::Rejected("mismatched batch lengths".to_string()))
            } else {
                Ok(())
            };

            if outcome.is_ok() && !state.hang {
                state.batches.push(PublishedBatch {
                    topic: topic.to_string(),
                    messages: messages.to_vec(),
                    keys: keys.to_vec(),
                    headers: headers.to_vec(),
                });
            }
            (outcome, state.hang, state.delay)
        };

        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}
