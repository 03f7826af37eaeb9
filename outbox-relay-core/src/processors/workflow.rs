//! Claim-process-commit workflow.
//!
//! Handles one outbox event inside one store transaction:
//!
//! 1. Re-claim the row with `FOR UPDATE SKIP LOCKED`; a missing row means
//!    another worker got there first (`RaceLost`)
//! 2. Transform the payload into a search document and a broker message
//! 3. Index the document and wait for the index to ack
//! 4. Publish the message and wait for the broker ack, retrying once after
//!    a short wait if the broker reports backpressure
//! 5. Mark the row processed and commit
//!
//! Any failure rolls the transaction back, leaving the event unprocessed for
//! a later poll. Sink deliveries are not part of the transaction, so a
//! failure after delivery means the event is delivered again later.

use crate::config::RelayConfig;
use crate::metrics::RelayMetrics;
use crate::sinks::{BrokerMessage, BrokerSink, DeliveryAck, Document, SearchSink, SinkError};
use crate::store::{OutboxStore, OutboxTransaction, StoreError, with_deadline};
use crate::transform::{EventTransformer, TransformError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Result of a workflow run that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowOutcome {
    /// Both sinks acked and the processed mark was committed
    Processed,
    /// The event was already processed, deleted or claimed by someone else
    RaceLost,
}

/// Errors that can occur while relaying one event.
///
/// The transaction is always rolled back when one of these is returned.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Begin, claim or mark failed
    #[error("store error: {0}")]
    Store(#[source] StoreError),

    /// Payload could not be projected
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// Search sink did not ack
    #[error("search sink error: {0}")]
    Search(#[source] SinkError),

    /// Broker sink did not ack
    #[error("broker sink error: {0}")]
    Broker(#[source] SinkError),

    /// Commit failed; nothing was persisted
    #[error("commit failed: {0}")]
    Commit(#[source] StoreError),
}

impl WorkflowError {
    /// Whether retrying the whole transaction right away may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            WorkflowError::Store(_) | WorkflowError::Commit(_) => true,
            WorkflowError::Transform(_) => false,
            WorkflowError::Search(e) | WorkflowError::Broker(e) => e.is_transient(),
        }
    }
}

/// Per-event transactional handler.
pub struct ClaimProcessCommit {
    store: Arc<dyn OutboxStore>,
    search: Arc<dyn SearchSink>,
    broker: Arc<dyn BrokerSink>,
    transformer: EventTransformer,
    metrics: Arc<RelayMetrics>,
    operation_timeout: Duration,
    immediate_retries: u32,
    backpressure_wait: Duration,
}

impl ClaimProcessCommit {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        search: Arc<dyn SearchSink>,
        broker: Arc<dyn BrokerSink>,
        transformer: EventTransformer,
        config: &RelayConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            store,
            search,
            broker,
            transformer,
            metrics,
            operation_timeout: config.operation_timeout,
            immediate_retries: config.immediate_retries,
            backpressure_wait: config.backpressure_wait,
        }
    }

    /// Relay one event, retrying transient failures up to the configured
    /// number of immediate retries.
    pub async fn run(&self, event_id: i64) -> Result<WorkflowOutcome, WorkflowError> {
        let mut retries = 0;
        let result = loop {
            match self.attempt(event_id).await {
                Err(e) if e.is_transient() && retries < self.immediate_retries => {
                    retries += 1;
                    debug!(event_id, retry = retries, error = %e, "Retrying event immediately");
                }
                result => break result,
            }
        };

        match &result {
            Ok(WorkflowOutcome::Processed) => self.metrics.record_processed(),
            Ok(WorkflowOutcome::RaceLost) => self.metrics.record_race_lost(),
            Err(e) => {
                match e {
                    WorkflowError::Transform(_) => self.metrics.record_transform_failure(),
                    WorkflowError::Search(_) | WorkflowError::Broker(_) => {
                        self.metrics.record_sink_failure()
                    }
                    WorkflowError::Store(_) => self.metrics.record_store_failure(),
                    WorkflowError::Commit(_) => self.metrics.record_commit_failure(),
                }
                if e.is_transient() {
                    warn!(event_id, error = %e, "Event left unprocessed until the next poll");
                }
            }
        }

        result
    }

    /// One transaction: claim, deliver, mark, commit.
    async fn attempt(&self, event_id: i64) -> Result<WorkflowOutcome, WorkflowError> {
        let mut tx = with_deadline("begin", self.operation_timeout, self.store.begin())
            .await
            .map_err(WorkflowError::Store)?;

        match self.process_claimed(&mut tx, event_id).await {
            Ok(WorkflowOutcome::Processed) => {
                with_deadline("commit", self.operation_timeout, tx.commit())
                    .await
                    .map_err(WorkflowError::Commit)?;
                debug!(event_id, "Event committed as processed");
                Ok(WorkflowOutcome::Processed)
            }
            Ok(WorkflowOutcome::RaceLost) => {
                self.rollback(tx, event_id).await;
                Ok(WorkflowOutcome::RaceLost)
            }
            Err(e) => {
                self.rollback(tx, event_id).await;
                Err(e)
            }
        }
    }

    async fn process_claimed(
        &self,
        tx: &mut Box<dyn OutboxTransaction>,
        event_id: i64,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        let claimed = with_deadline(
            "claim_for_update",
            self.operation_timeout,
            tx.claim_for_update(event_id),
        )
        .await
        .map_err(WorkflowError::Store)?;

        let Some(event) = claimed else {
            debug!(event_id, "Event already handled elsewhere");
            return Ok(WorkflowOutcome::RaceLost);
        };

        let projected = self.transformer.transform(&event).inspect_err(|e| {
            error!(event_id, error = %e, "Event payload cannot be transformed");
        })?;

        self.index(&projected.document)
            .await
            .map_err(WorkflowError::Search)?;

        let ack = self
            .publish(&projected.message)
            .await
            .map_err(WorkflowError::Broker)?;
        debug!(
            event_id,
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Broker acknowledged delivery"
        );

        with_deadline(
            "mark_processed",
            self.operation_timeout,
            tx.mark_processed(event_id),
        )
        .await
        .map_err(WorkflowError::Store)?;

        Ok(WorkflowOutcome::Processed)
    }

    async fn index(&self, document: &Document) -> Result<(), SinkError> {
        self.bounded(self.search.index(document))
            .await
            .inspect_err(|e| {
                warn!(index = %document.index, id = %document.id, error = %e, "Search sink delivery failed");
            })
    }

    async fn publish(&self, message: &BrokerMessage) -> Result<DeliveryAck, SinkError> {
        let result = match self.bounded(self.broker.publish(message)).await {
            Err(SinkError::Backpressure(reason)) => {
                warn!(
                    topic = %message.topic,
                    reason = %reason,
                    "Broker applying backpressure, retrying once"
                );
                tokio::time::sleep(self.backpressure_wait).await;
                self.bounded(self.broker.publish(message)).await
            }
            other => other,
        };

        result.inspect_err(|e| {
            warn!(topic = %message.topic, dedup_id = %message.dedup_id, error = %e, "Broker publish failed");
        })
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, SinkError>
    where
        F: Future<Output = Result<T, SinkError>>,
    {
        tokio::time::timeout(self.operation_timeout, call)
            .await
            .unwrap_or(Err(SinkError::Timeout))
    }

    async fn rollback(&self, tx: Box<dyn OutboxTransaction>, event_id: i64) {
        if let Err(e) = with_deadline("rollback", self.operation_timeout, tx.rollback()).await {
            warn!(event_id, error = %e, "Rollback failed");
        }
    }
}
