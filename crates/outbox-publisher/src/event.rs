//! Domain events as supplied by business code.

use crate::OutboxResult;
use outbox_database::NewEventRecord;
use serde::{Deserialize, Serialize};

/// An event raised by an aggregate, ready to be written to the outbox.
///
/// The payload is opaque to the outbox; it is stored and published as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_version: i32,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Explicit topic; derived from the event and aggregate types when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    topic_override: Option<String>,
}

impl DomainEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            event_version: 1,
            payload,
            correlation_id: None,
            causation_id: None,
            user_id: None,
            topic_override: None,
        }
    }

    /// Build an event from any serializable payload.
    pub fn from_payload<T: Serialize>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: &T,
    ) -> OutboxResult<Self> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self::new(aggregate_type, aggregate_id, event_type, payload))
    }

    pub fn with_version(mut self, version: i32) -> Self {
        self.event_version = version;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Route the event to `topic` instead of the derived one.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic_override = Some(topic.into());
        self
    }

    /// Target broker topic.
    ///
    /// Dotted event types (`"orders.placed"`) use their first segment;
    /// otherwise the aggregate type names the topic. Always lowercase.
    pub fn topic(&self) -> String {
        if let Some(topic) = &self.topic_override {
            return topic.clone();
        }
        let base = match self.event_type.split_once('.') {
            Some((prefix, _)) if !prefix.is_empty() => prefix,
            _ => self.aggregate_type.as_str(),
        };
        base.to_lowercase()
    }

    /// Broker partition key; one aggregate always maps to one partition.
    pub fn partition_key(&self) -> &str {
        &self.aggregate_id
    }

    /// Build the outbox row for this event under the given id.
    pub fn to_new_record(&self, id: String) -> OutboxResult<NewEventRecord> {
        Ok(NewEventRecord {
            id,
            aggregate_id: self.aggregate_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            event_type: self.event_type.clone(),
            event_version: self.event_version,
            payload: serde_json::to_string(&self.payload)?,
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            user_id: self.user_id.clone(),
            topic: self.topic(),
            partition_key: self.partition_key().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_from_aggregate_type() {
        let event = DomainEvent::new("Order", "order-1", "OrderPlaced", json!({}));
        assert_eq!(event.topic(), "order");
    }

    #[test]
    fn test_topic_from_dotted_event_type() {
        let event = DomainEvent::new("Order", "order-1", "Payments.Captured", json!({}));
        assert_eq!(event.topic(), "payments");

        let leading_dot = DomainEvent::new("Order", "order-1", ".captured", json!({}));
        assert_eq!(leading_dot.topic(), "order");
    }

    #[test]
    fn test_topic_override() {
        let event = DomainEvent::new("Order", "order-1", "OrderPlaced", json!({})).with_topic("orders");
        assert_eq!(event.topic(), "orders");
    }

    #[test]
    fn test_partition_key_is_aggregate_id() {
        let a = DomainEvent::new("Order", "order-1", "OrderPlaced", json!({}));
        let b = DomainEvent::new("Order", "order-1", "OrderShipped", json!({}));
        assert_eq!(a.partition_key(), "order-1");
        assert_eq!(a.partition_key(), b.partition_key());
    }

    #[test]
    fn test_to_new_record() {
        let event = DomainEvent::new("Order", "order-1", "OrderPlaced", json!({"total": 42}))
            .with_version(2)
            .with_correlation_id("corr")
            .with_causation_id("cause")
            .with_user_id("user");

        let record = event.to_new_record("evt-1".to_string()).unwrap();
        assert_eq!(record.id, "evt-1");
        assert_eq!(record.event_version, 2);
        assert_eq!(record.payload, r#"{"total":42}"#);
        assert_eq!(record.correlation_id.as_deref(), Some("corr"));
        assert_eq!(record.causation_id.as_deref(), Some("cause"));
        assert_eq!(record.user_id.as_deref(), Some("user"));
        assert_eq!(record.topic, "order");
        assert_eq!(record.partition_key, "order-1");
    }

    #[test]
    fn test_from_payload() {
        #[derive(Serialize)]
        struct Placed {
            total: u32,
        }

        let event = DomainEvent::from_payload("Order", "order-1", "OrderPlaced", &Placed { total: 7 }).unwrap();
        assert_eq!(event.payload, json!({"total": 7}));
        assert_eq!(event.event_version, 1);
    }
}
