//! Outbox error types.

use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Persistence failed. Raised from `store` inside the caller's
    /// transaction, which must then roll back.
    #[error("Storage error: {0}")]
    Storage(#[from] outbox_database::DatabaseError),

    /// Event payload could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker rejected or failed a topic group
    #[error("Dispatch to topic {topic} failed: {source}")]
    Dispatch {
        topic: String,
        #[source]
        source: BrokerError,
    },

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for OutboxError {
    fn from(e: rusqlite::Error) -> Self {
        OutboxError::Storage(e.into())
    }
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Failure reported by a broker publish call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker could not be reached
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Broker refused the batch
    #[error("broker rejected batch: {0}")]
    Rejected(String),

    /// Publish did not complete in time
    #[error("broker publish timed out after {0:?}")]
    Timeout(std::time::Duration),
}
