use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type TaskId = u64;
pub type Offset = u64;
pub type CollectionName = String;

pub const HEADER_CE_ID: &str = "ce_id";
pub const HEADER_CE_TYPE: &str = "ce_type";
pub const HEADER_CE_SOURCE: &str = "ce_source";
pub const HEADER_CE_SPEC_VERSION: &str = "ce_specversion";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_EVENT_ID: &str = "etl-event-id";

pub const CLOUD_EVENTS_SPEC_VERSION: &str = "1.0";
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Put,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Put => write!(f, "put"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

/// A document mutation read from the database change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Position of the event in the feed, strictly increasing.
    pub offset: Offset,
    pub document_id: String,
    pub collection: CollectionName,
    /// Document contents after the mutation. `None` for deletes.
    pub snapshot: Option<serde_json::Value>,
    pub mutation: MutationKind,
}

impl ChangeEvent {
    pub fn put(
        offset: Offset,
        collection: impl Into<String>,
        document_id: impl Into<String>,
        snapshot: serde_json::Value,
    ) -> Self {
        Self {
            offset,
            document_id: document_id.into(),
            collection: collection.into(),
            snapshot: Some(snapshot),
            mutation: MutationKind::Put,
        }
    }

    pub fn delete(
        offset: Offset,
        collection: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Self {
        Self {
            offset,
            document_id: document_id.into(),
            collection: collection.into(),
            snapshot: None,
            mutation: MutationKind::Delete,
        }
    }

    /// Identifier stamped on every message derived from this event, stable
    /// across redeliveries so consumers can drop duplicates.
    pub fn event_id(&self) -> String {
        format!("{}/{}@{}", self.collection, self.document_id, self.offset)
    }
}

/// A message produced by a transformation, ready for a broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Kafka topic or RabbitMQ exchange/queue.
    pub destination: String,
    pub key: String,
    pub partition_key: Option<String>,
    pub routing_key: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl OutboundMessage {
    pub fn new(destination: impl Into<String>, key: impl Into<String>, body: Bytes) -> Self {
        Self {
            destination: destination.into(),
            key: key.into(),
            partition_key: None,
            routing_key: None,
            headers: BTreeMap::new(),
            body,
        }
    }

    /// Key used to pick a partition: the explicit partition key when the
    /// script provided one, otherwise the message key.
    pub fn partitioning_key(&self) -> &str {
        self.partition_key.as_deref().unwrap_or(&self.key)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}
