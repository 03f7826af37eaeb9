//! Outbox store contract.
//!
//! The relay and the GC only ever talk to the outbox through these traits,
//! so they can run against PostgreSQL in production and against the
//! in-memory store in tests.
//!
//! - `PgOutboxStore`: `SELECT ... FOR UPDATE SKIP LOCKED` on a Postgres table
//! - `MemoryOutboxStore`: same locking semantics over a `BTreeMap`

pub mod memory;
pub mod postgres;

pub use memory::MemoryOutboxStore;
pub use postgres::PgOutboxStore;

use crate::entities::OutboxEvent;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by an outbox store.
///
/// Every variant is transient from the relay's point of view: the failed
/// operation is retried on the next poll or sweep.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The operation did not finish within its deadline
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// `mark_processed` was called for an event this transaction never claimed
    #[error("event {0} is not claimed by this transaction")]
    NotClaimed(i64),

    /// The store could not serve the request
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Access to the outbox table outside of any transaction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Fetch up to `limit` unprocessed events ordered by id ascending,
    /// skipping rows currently locked by an in-flight claim.
    async fn poll_unprocessed(&self, limit: u32) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Open a transaction for one claim-process-commit run.
    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, StoreError>;

    /// Delete every processed event. Returns the number of rows removed.
    async fn delete_processed(&self) -> Result<u64, StoreError>;
}

/// One open store transaction.
///
/// Dropping a transaction without committing rolls it back and releases
/// every claim it holds.
#[async_trait]
pub trait OutboxTransaction: Send {
    /// Lock one unprocessed event for the lifetime of the transaction.
    ///
    /// Returns `None` when the row was processed, deleted, or is locked by
    /// another transaction.
    async fn claim_for_update(&mut self, id: i64) -> Result<Option<OutboxEvent>, StoreError>;

    /// Mark a claimed event as processed. Takes effect on commit.
    async fn mark_processed(&mut self, id: i64) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Bound a store operation by `timeout`.
pub async fn with_deadline<T, F>(
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { operation, timeout }),
    }
}
