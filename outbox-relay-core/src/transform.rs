//! Projection of outbox events into sink payloads.
//!
//! The payload column holds a JSON envelope:
//!
//! ```json
//! { "event_type": "order.created", "aggregate_id": "42", "data": { ... } }
//! ```
//!
//! `aggregate_id` and `data` are optional, and other top-level keys are
//! ignored. A payload without a string `event_type` is malformed, which is a
//! permanent failure for that event.

use crate::entities::OutboxEvent;
use crate::sinks::{BrokerMessage, Document};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while transforming an event.
///
/// All of them are permanent: retrying the same payload fails the same way.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Payload does not match the envelope shape
    #[error("event {event_id} has a malformed payload: {source}")]
    MalformedPayload {
        event_id: i64,
        #[source]
        source: serde_json::Error,
    },

    /// Event type cannot be used as a topic segment
    #[error("event {event_id} has an invalid event type {event_type:?}")]
    InvalidEventType { event_id: i64, event_type: String },

    /// Broker payload serialization error
    #[error("failed to serialize broker payload for event {event_id}: {source}")]
    Serialization {
        event_id: i64,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct PayloadEnvelope {
    event_type: String,
    #[serde(default)]
    aggregate_id: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

/// Body shared by the search document and the broker message.
#[derive(Debug, Serialize)]
struct Projection<'a> {
    event_id: i64,
    event_type: &'a str,
    aggregate_id: Option<&'a str>,
    data: &'a serde_json::Value,
}

/// Both sink payloads derived from one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Projected {
    pub document: Document,
    pub message: BrokerMessage,
}

/// Derives sink payloads from outbox events.
///
/// Deterministic: the same event always yields the same projection.
#[derive(Debug, Clone)]
pub struct EventTransformer {
    index: String,
    topic_prefix: String,
}

impl EventTransformer {
    pub fn new(index: impl Into<String>, topic_prefix: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            topic_prefix: topic_prefix.into(),
        }
    }

    pub fn transform(&self, event: &OutboxEvent) -> Result<Projected, TransformError> {
        let event_id = event.id;
        let envelope = PayloadEnvelope::deserialize(&event.payload)
            .map_err(|source| TransformError::MalformedPayload { event_id, source })?;

        if !is_valid_event_type(&envelope.event_type) {
            return Err(TransformError::InvalidEventType {
                event_id,
                event_type: envelope.event_type,
            });
        }

        let projection = Projection {
            event_id,
            event_type: &envelope.event_type,
            aggregate_id: envelope.aggregate_id.as_deref(),
            data: &envelope.data,
        };

        let body = serde_json::to_value(&projection)
            .map_err(|source| TransformError::Serialization { event_id, source })?;
        let payload = serde_json::to_vec(&projection)
            .map_err(|source| TransformError::Serialization { event_id, source })?;

        let document = Document {
            index: self.index.clone(),
            id: event_id.to_string(),
            body,
        };

        let message = BrokerMessage {
            topic: format!("{}.{}", self.topic_prefix, envelope.event_type),
            key: envelope
                .aggregate_id
                .clone()
                .unwrap_or_else(|| event_id.to_string()),
            dedup_id: format!("outbox-{event_id}"),
            payload,
        };

        Ok(Projected { document, message })
    }
}

/// Event types become topic segments, so wildcards and whitespace are out.
fn is_valid_event_type(event_type: &str) -> bool {
    !event_type.is_empty()
        && !event_type.starts_with('.')
        && !event_type.ends_with('.')
        && !event_type.contains("..")
        && event_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
