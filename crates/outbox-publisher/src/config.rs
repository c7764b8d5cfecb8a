//! Publisher configuration.

use crate::{OutboxError, OutboxResult};
use observability::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Outbox publisher configuration.
///
/// Loaded from JSON; any field missing from the file takes its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Seconds between dispatch ticks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum records selected per dispatch tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Dispatch attempts before a record is left exhausted.
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    /// Minimum seconds between attempts on a failed record.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Seconds between cleanup runs.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Published records older than this many hours are deleted.
    #[serde(default = "default_cleanup_age_hours")]
    pub cleanup_age_hours: u64,
    /// Upper bound on a single broker publish call.
    #[serde(default = "default_broker_timeout_secs")]
    pub broker_timeout_secs: u64,
    /// Health degrades when exhausted records exceed this.
    #[serde(default = "default_degraded_failed_threshold")]
    pub degraded_failed_threshold: i64,
    /// Health degrades when pending records exceed this.
    #[serde(default = "default_degraded_pending_threshold")]
    pub degraded_pending_threshold: i64,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_batch_size() -> usize {
    100
}

fn default_max_retries() -> i32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    30
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_cleanup_age_hours() -> u64 {
    24
}

fn default_broker_timeout_secs() -> u64 {
    30
}

fn default_degraded_failed_threshold() -> i64 {
    100
}

fn default_degraded_pending_threshold() -> i64 {
    1000
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            cleanup_age_hours: default_cleanup_age_hours(),
            broker_timeout_secs: default_broker_timeout_secs(),
            degraded_failed_threshold: default_degraded_failed_threshold(),
            degraded_pending_threshold: default_degraded_pending_threshold(),
            log_level: default_log_level(),
        }
    }
}

impl OutboxConfig {
    /// Defaults overridden from `OUTBOX_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from a JSON file.
    pub fn load_from_file(path: &Path) -> OutboxResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OutboxConfig = serde_json::from_str(&content)
            .map_err(|e| OutboxError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Override fields from environment variables.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn load_from_env(&mut self) {
        self.load_from_lookup(|key| std::env::var(key).ok());
    }

    fn load_from_lookup<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "OUTBOX_POLL_INTERVAL_SECS", &mut self.poll_interval_secs);
        override_from(&lookup, "OUTBOX_BATCH_SIZE", &mut self.batch_size);
        override_from(&lookup, "OUTBOX_MAX_RETRIES", &mut self.max_retries);
        override_from(&lookup, "OUTBOX_RETRY_DELAY_SECS", &mut self.retry_delay_secs);
        override_from(&lookup, "OUTBOX_CLEANUP_INTERVAL_SECS", &mut self.cleanup_interval_secs);
        override_from(&lookup, "OUTBOX_CLEANUP_AGE_HOURS", &mut self.cleanup_age_hours);
        override_from(&lookup, "OUTBOX_BROKER_TIMEOUT_SECS", &mut self.broker_timeout_secs);
        if let Some(level) = lookup("OUTBOX_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Reject settings the background loops cannot run with.
    pub fn validate(&self) -> OutboxResult<()> {
        if self.batch_size == 0 {
            return Err(OutboxError::Config("batch_size must be greater than 0".to_string()));
        }
        if self.max_retries <= 0 {
            return Err(OutboxError::Config("max_retries must be greater than 0".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(OutboxError::Config(
                "poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(OutboxError::Config(
                "cleanup_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.broker_timeout_secs == 0 {
            return Err(OutboxError::Config(
                "broker_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_delay_secs as i64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn cleanup_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cleanup_age_hours as i64)
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_timeout_secs)
    }

    /// Logging settings for a host binary; `RUST_LOG` still wins.
    pub fn log_config(&self, service_name: &str) -> LogConfig {
        LogConfig {
            service_name: service_name.to_string(),
            default_level: self.log_level.clone(),
            ..Default::default()
        }
    }
}

fn override_from<T, F>(lookup: &F, key: &str, target: &mut T)
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => warn!(key, value = %raw, "Ignoring unparseable environment override"),
    }
}
