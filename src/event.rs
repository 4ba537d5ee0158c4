//! Inbound records and the events they carry.
use serde_json::{json, Map, Value};

/// Structured document decoded from a message payload.
pub type Document = Map<String, Value>;

/// Discriminator value of order events.
pub const ORDER: &str = "order";
/// Discriminator value of inventory adjustment events.
pub const INVENTORY_ADJUSTMENT: &str = "inventory_adjustment";
/// Label used for events without a usable `event_type`.
pub const UNKNOWN: &str = "unknown";

/// Whether any string or object key inside `value` holds U+0000.
///
/// Postgres `jsonb` cannot represent that character, so such documents are
/// rejected before they reach a batch.
pub fn contains_nul(value: &Value) -> bool {
    match value {
        Value::String(text) => text.contains('\0'),
        Value::Array(items) => items.iter().any(contains_nul),
        Value::Object(map) => document_contains_nul(map),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

pub fn document_contains_nul(document: &Document) -> bool {
    document
        .iter()
        .any(|(key, value)| key.contains('\0') || contains_nul(value))
}

/// Position and producer metadata of one inbound message.
///
/// Built once by the stream reader and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    topic: String,
    source_partition: i32,
    source_offset: i64,
    ingest_timestamp: Option<i64>,
    routing_key: Option<String>,
}

impl Envelope {
    pub fn new(
        topic: impl Into<String>,
        source_partition: i32,
        source_offset: i64,
        ingest_timestamp: Option<i64>,
        routing_key: Option<String>,
    ) -> Self {
        Envelope {
            topic: topic.into(),
            source_partition,
            source_offset,
            ingest_timestamp,
            routing_key,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn source_partition(&self) -> i32 {
        self.source_partition
    }

    pub fn source_offset(&self) -> i64 {
        self.source_offset
    }

    /// Producer-side timestamp in epoch milliseconds, when the broker has one.
    pub fn ingest_timestamp(&self) -> Option<i64> {
        self.ingest_timestamp
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    /// Metadata document stored next to the event content in the warehouse.
    pub fn metadata(&self) -> Value {
        json!({
            "topic": self.topic,
            "partition": self.source_partition,
            "offset": self.source_offset,
            "timestamp_ms": self.ingest_timestamp,
            "key": self.routing_key,
        })
    }
}

/// One message as returned by the broker: envelope plus the undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub envelope: Envelope,
    /// `None` for tombstones and other payload-less messages.
    pub payload: Option<Vec<u8>>,
}

/// A decoded event, discriminated by its `event_type` field.
///
/// Every variant keeps the full document: the warehouse stores the raw
/// content and transformation happens downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Order(Document),
    InventoryAdjustment(Document),
    /// Any other (or missing) `event_type`, passed through as is.
    Unknown {
        event_type: Option<String>,
        document: Document,
    },
}

impl Event {
    pub fn from_document(document: Document) -> Self {
        let event_type = document
            .get("event_type")
            .and_then(Value::as_str)
            .map(str::to_owned);
        match event_type.as_deref() {
            Some(ORDER) => Event::Order(document),
            Some(INVENTORY_ADJUSTMENT) => Event::InventoryAdjustment(document),
            _ => Event::Unknown {
                event_type,
                document,
            },
        }
    }

    /// Label for logs and metrics; `unknown` when the document carries none.
    pub fn event_type(&self) -> &str {
        match self {
            Event::Order(_) => ORDER,
            Event::InventoryAdjustment(_) => INVENTORY_ADJUSTMENT,
            Event::Unknown {
                event_type: Some(event_type),
                ..
            } => event_type,
            Event::Unknown { .. } => UNKNOWN,
        }
    }

    pub fn document(&self) -> &Document {
        match self {
            Event::Order(document) | Event::InventoryAdjustment(document) => document,
            Event::Unknown { document, .. } => document,
        }
    }

    /// Canonical text encoding of the content. Keys come out sorted.
    pub fn content(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self.document())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn known_types_are_discriminated() {
        let order = Event::from_document(document(json!({"event_type": "order", "id": "A"})));
        assert!(matches!(order, Event::Order(_)));
        assert_eq!(order.event_type(), ORDER);

        let adjustment =
            Event::from_document(document(json!({"event_type": "inventory_adjustment"})));
        assert!(matches!(adjustment, Event::InventoryAdjustment(_)));
    }

    #[test]
    fn unknown_types_pass_through() {
        let event = Event::from_document(document(json!({"event_type": "refund", "x": 1})));
        assert_eq!(event.event_type(), "refund");
        assert_eq!(event.document().get("x"), Some(&json!(1)));

        let untyped = Event::from_document(document(json!({"event_type": 7})));
        assert_eq!(untyped.event_type(), UNKNOWN);
        assert!(matches!(untyped, Event::Unknown { event_type: None, .. }));
    }

    #[test]
    fn content_is_canonical() {
        let event = Event::from_document(document(json!({"quantity": 2, "event_type": "order"})));
        assert_eq!(
            event.content().unwrap(),
            r#"{"event_type":"order","quantity":2}"#
        );
    }

    #[test]
    fn nul_characters_are_found_at_any_depth() {
        assert!(!document_contains_nul(&document(
            json!({"id": "A", "lines": [{"sku": "X-1", "qty": 2}], "note": null})
        )));
        assert!(document_contains_nul(&document(json!({"id": "A\u{0}"}))));
        assert!(document_contains_nul(&document(json!({"ke\u{0}y": 1}))));
        assert!(document_contains_nul(&document(
            json!({"lines": [{"sku": ["X", "\u{0}"]}]})
        )));
        // an escaped backslash followed by u0000 is ordinary text
        let escaped: Document = serde_json::from_str(r#"{"id":"\\u0000"}"#).unwrap();
        assert!(!document_contains_nul(&escaped));
        let decoded: Document = serde_json::from_str(r#"{"id":"A\u0000"}"#).unwrap();
        assert!(document_contains_nul(&decoded));

        let keyed = Envelope::new("sales", 0, 1, None, Some("k\0".into()));
        assert!(contains_nul(&keyed.metadata()));
    }

    #[test]
    fn metadata_carries_position() {
        let envelope = Envelope::new("sales", 3, 42, Some(1_700_000_000_000), Some("k".into()));
        assert_eq!(
            envelope.metadata(),
            json!({
                "topic": "sales",
                "partition": 3,
                "offset": 42,
                "timestamp_ms": 1_700_000_000_000i64,
                "key": "k",
            })
        );
    }
}
