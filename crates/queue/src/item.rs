use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pirepsync_core::{FieldValue, TenantId};

use crate::store::QueueError;

/// Name of the single stream field holding the JSON-encoded item.
pub const PAYLOAD_FIELD: &str = "data";

/// Opaque broker-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw PIREP as produced by the external source.
///
/// Wire form: `{va_id, airtable_record_id, fields, created_time}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub va_id: TenantId,
    pub airtable_record_id: String,
    #[serde(default)]
    pub fields: HashMap<String, FieldValue>,
    #[serde(default)]
    pub created_time: String,
}

impl QueueItem {
    pub fn new(va_id: TenantId, airtable_record_id: impl Into<String>) -> Self {
        Self {
            va_id,
            airtable_record_id: airtable_record_id.into(),
            fields: HashMap::new(),
            created_time: String::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_created_time(mut self, created_time: impl Into<String>) -> Self {
        self.created_time = created_time.into();
        self
    }

    pub fn to_payload(&self) -> Result<String, QueueError> {
        serde_json::to_string(self).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    pub fn from_payload(payload: &str) -> Result<Self, QueueError> {
        serde_json::from_str(payload).map_err(|e| QueueError::Serialization(e.to_string()))
    }
}

/// A message handed to one consumer; must be acked by that consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub item: QueueItem,
}

/// One row of the consumer group's pending-entries list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub message_id: MessageId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip_preserves_structure() {
        let item = QueueItem::new(TenantId::new(), "recABC")
            .with_field("Route", "KSEA-KLAX")
            .with_field("FlightTime", 125.5)
            .with_field("PilotID", vec!["rec123".to_string()])
            .with_created_time("2024-05-01T10:00:00.000Z");

        let payload = item.to_payload().unwrap();
        assert_eq!(QueueItem::from_payload(&payload).unwrap(), item);
    }

    #[test]
    fn decodes_producer_wire_format() {
        let payload = r#"{
            "va_id": "0191d3b2-7c4e-7a10-9f00-123456789abc",
            "airtable_record_id": "recXYZ",
            "fields": {"Route": "EGLL-KJFK", "Blocks": 7},
            "created_time": "2024-05-01T10:00:00.000Z"
        }"#;
        let item = QueueItem::from_payload(payload).unwrap();
        assert_eq!(item.airtable_record_id, "recXYZ");
        assert_eq!(item.fields["Blocks"], FieldValue::Number(7.0));
    }

    #[test]
    fn malformed_payload_is_a_serialization_error() {
        let err = QueueItem::from_payload("{not json").unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));
        assert!(!err.is_transient());
    }
}
