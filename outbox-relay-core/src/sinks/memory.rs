//! Recording sinks.
//!
//! Keep everything they receive in memory and fail on demand. Used to run
//! the relay without a search cluster or broker.

use super::{BrokerMessage, BrokerSink, DeliveryAck, Document, SearchSink, SinkError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Search sink that records every indexed document.
#[derive(Debug, Default)]
pub struct RecordingSearchSink {
    documents: Mutex<Vec<Document>>,
    failures: Mutex<VecDeque<SinkError>>,
    latency: Option<Duration>,
}

impl RecordingSearchSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next call with `error`. Queued failures are served in order.
    pub fn fail_next(&self, error: SinkError) {
        lock(&self.failures).push_back(error);
    }

    pub fn documents(&self) -> Vec<Document> {
        lock(&self.documents).clone()
    }
}

#[async_trait]
impl SearchSink for RecordingSearchSink {
    async fn index(&self, document: &Document) -> Result<(), SinkError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        lock(&self.documents).push(document.clone());
        Ok(())
    }
}

/// Broker sink that records every published message and acks it with a
/// monotonically increasing sequence.
#[derive(Debug)]
pub struct RecordingBrokerSink {
    stream: String,
    messages: Mutex<Vec<BrokerMessage>>,
    failures: Mutex<VecDeque<SinkError>>,
    latency: Option<Duration>,
}

impl Default for RecordingBrokerSink {
    fn default() -> Self {
        Self {
            stream: "OUTBOX".to_string(),
            messages: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            latency: None,
        }
    }
}

impl RecordingBrokerSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next call with `error`. Queued failures are served in order.
    pub fn fail_next(&self, error: SinkError) {
        lock(&self.failures).push_back(error);
    }

    pub fn messages(&self) -> Vec<BrokerMessage> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl BrokerSink for RecordingBrokerSink {
    async fn publish(&self, message: &BrokerMessage) -> Result<DeliveryAck, SinkError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }

        let mut messages = lock(&self.messages);
        let duplicate = messages.iter().any(|m| m.dedup_id == message.dedup_id);
        messages.push(message.clone());
        Ok(DeliveryAck {
            stream: self.stream.clone(),
            sequence: messages.len() as u64,
            duplicate,
        })
    }
}
