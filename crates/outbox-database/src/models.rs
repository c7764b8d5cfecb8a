//! Database models for the outbox table.

use crate::DatabaseResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbox row - a domain event awaiting (or past) publication.
///
/// Everything except the delivery bookkeeping (`processed`, `processed_at`,
/// `retry_count`, `error_message`, `updated_at`) is fixed at insert time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_version: i32,
    /// Serialized JSON payload, never interpreted by the outbox.
    pub payload: String,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub user_id: Option<String>,
    pub topic: String,
    pub partition_key: String,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventRecord {
    /// Whether the record has used up its dispatch attempts without publishing.
    pub fn is_exhausted(&self, max_retries: i32) -> bool {
        !self.processed && self.retry_count >= max_retries
    }

    /// Delivery state of the record for the given retry ceiling.
    pub fn state(&self, max_retries: i32) -> RecordState {
        if self.processed {
            RecordState::Published
        } else if self.retry_count >= max_retries {
            RecordState::Exhausted
        } else if self.retry_count > 0 {
            RecordState::RetryPending
        } else {
            RecordState::Pending
        }
    }

    /// Parse the stored payload back into JSON.
    pub fn payload_json(&self) -> DatabaseResult<serde_json::Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Delivery state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Never attempted.
    Pending,
    /// Failed at least once, waiting out the retry delay.
    RetryPending,
    /// Acknowledged by the broker.
    Published,
    /// Retry ceiling reached; needs operator intervention.
    Exhausted,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::RetryPending => "retry_pending",
            Self::Published => "published",
            Self::Exhausted => "exhausted",
        }
    }
}

/// New outbox row for insertion.
#[derive(Debug, Clone)]
pub struct NewEventRecord {
    pub id: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_version: i32,
    pub payload: String,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub user_id: Option<String>,
    pub topic: String,
    pub partition_key: String,
}
