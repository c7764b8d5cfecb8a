//! Status and health reporting types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of the publisher and its table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherStatus {
    pub is_running: bool,
    /// Unprocessed records, exhausted ones included.
    pub pending_events: i64,
    /// Unprocessed records at or above `max_retries`.
    pub failed_events: i64,
    /// Published records not yet removed by cleanup.
    pub published_events: i64,
    pub batch_size: usize,
    /// Seconds between dispatch ticks.
    pub poll_interval: u64,
    pub max_retries: i32,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub last_cleanup_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub errors: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Outcome of a single dispatch tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Records returned by selection.
    pub selected: usize,
    /// Records marked published.
    pub published: usize,
    /// Records marked failed.
    pub failed: usize,
    /// Topic groups published to, in first-seen order.
    pub topics: Vec<String>,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        self.selected == 0
    }
}
