//! Sink contracts.
//!
//! An outbox event is delivered to two sinks:
//!
//! - `SearchSink`: indexes a [`Document`] and returns once the index acked
//! - `BrokerSink`: publishes a [`BrokerMessage`] and returns the broker's
//!   per-message [`DeliveryAck`]
//!
//! Both calls are awaited by the workflow before the event is marked
//! processed.

pub mod memory;

pub use memory::{RecordingBrokerSink, RecordingSearchSink};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Projection of an outbox event for the search index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    /// Target index.
    pub index: String,
    /// Document id. Derived from the event id so re-indexing overwrites.
    pub id: String,
    pub body: serde_json::Value,
}

/// Serialized projection of an outbox event for the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    /// Partitioning key (aggregate id, or the event id when absent).
    pub key: String,
    /// Stable per-event id consumers and brokers can deduplicate on.
    pub dedup_id: String,
    pub payload: Vec<u8>,
}

/// Broker acknowledgment that a message is durably queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub stream: String,
    pub sequence: u64,
    /// The broker had already seen this dedup id.
    pub duplicate: bool,
}

/// Errors that can occur while delivering to a sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The call did not complete within its deadline
    #[error("sink call timed out")]
    Timeout,

    /// The sink's queue is full; retrying shortly may succeed
    #[error("sink is applying backpressure: {0}")]
    Backpressure(String),

    /// Connection failure or server-side error
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// The sink refused the request
    #[error("sink rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl SinkError {
    /// Whether an immediate retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SinkError::Rejected { .. })
    }
}

/// Search index client.
#[async_trait]
pub trait SearchSink: Send + Sync {
    async fn index(&self, document: &Document) -> Result<(), SinkError>;
}

/// Message broker client. The destination topic travels on the message.
#[async_trait]
pub trait BrokerSink: Send + Sync {
    async fn publish(&self, message: &BrokerMessage) -> Result<DeliveryAck, SinkError>;
}
