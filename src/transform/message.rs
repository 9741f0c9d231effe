use bytes::Bytes;
use rhai::{Dynamic, Map};

use crate::error::TransformError;
use crate::types::{
    ChangeEvent, OutboundMessage, CLOUD_EVENTS_SPEC_VERSION, HEADER_CE_ID, HEADER_CE_SOURCE,
    HEADER_CE_SPEC_VERSION, HEADER_CE_TYPE, HEADER_CONTENT_TYPE, HEADER_EVENT_ID,
    JSON_CONTENT_TYPE,
};

/// One `loadTo` call recorded during a script run.
#[derive(Debug, Clone)]
pub struct Emit {
    pub destination: String,
    pub payload: Dynamic,
    pub routing_key: Option<String>,
    pub attributes: Map,
}

impl Emit {
    /// Builds the broker message for this emit. Attributes follow the
    /// CloudEvents names used by scripts: `Id`, `PartitionKey`, `Type`,
    /// `Source`. Other attributes become `ce_<name>` headers.
    pub fn into_message(
        self,
        transform: &str,
        event: &ChangeEvent,
    ) -> Result<OutboundMessage, TransformError> {
        let invalid = |message: String| TransformError::InvalidOutput {
            transform: transform.to_string(),
            message,
        };

        let payload: serde_json::Value = rhai::serde::from_dynamic(&self.payload)
            .map_err(|e| invalid(format!("payload for '{}': {}", self.destination, e)))?;
        let body = serde_json::to_vec(&payload)
            .map_err(|e| invalid(format!("payload for '{}': {}", self.destination, e)))?;

        let mut message = OutboundMessage::new(
            self.destination,
            event.document_id.clone(),
            Bytes::from(body),
        );
        message.routing_key = self.routing_key.filter(|key| !key.is_empty());

        message
            .headers
            .insert(HEADER_CE_ID.to_string(), event.event_id());
        message.headers.insert(
            HEADER_CE_SPEC_VERSION.to_string(),
            CLOUD_EVENTS_SPEC_VERSION.to_string(),
        );
        message
            .headers
            .insert(HEADER_CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string());
        message
            .headers
            .insert(HEADER_EVENT_ID.to_string(), event.event_id());

        for (name, value) in self.attributes {
            let value = attribute_text(&value);
            match name.as_str() {
                "Id" => {
                    message.headers.insert(HEADER_CE_ID.to_string(), value.clone());
                    message.key = value;
                }
                "PartitionKey" => message.partition_key = Some(value),
                "Type" => {
                    message.headers.insert(HEADER_CE_TYPE.to_string(), value);
                }
                "Source" => {
                    message.headers.insert(HEADER_CE_SOURCE.to_string(), value);
                }
                other => {
                    message
                        .headers
                        .insert(format!("ce_{}", other.to_lowercase()), value);
                }
            }
        }

        Ok(message)
    }
}

fn attribute_text(value: &Dynamic) -> String {
    match value.clone().into_immutable_string() {
        Ok(text) => text.to_string(),
        Err(_) => value.to_string(),
    }
}
