use super::{OutboxStore, OutboxTransaction, StoreError};
use crate::entities::{DeleteProcessedEvents, OutboxEvent, OutboxTable, PollUnprocessedEvents};
use crate::framework::{DatabaseProcessor, TransactionProcessor};
use async_trait::async_trait;
use kanau::processor::Processor;
use sqlx::PgPool;

/// Outbox store backed by a Postgres table.
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    processor: DatabaseProcessor,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool, table: OutboxTable) -> Self {
        Self {
            processor: DatabaseProcessor { pool, table },
        }
    }

    pub fn table(&self) -> &OutboxTable {
        &self.processor.table
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn poll_unprocessed(&self, limit: u32) -> Result<Vec<OutboxEvent>, StoreError> {
        let events = self
            .processor
            .process(PollUnprocessedEvents { limit })
            .await?;
        Ok(events)
    }

    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, StoreError> {
        let tx = self.processor.pool.begin().await?;
        Ok(Box::new(TransactionProcessor {
            tx,
            table: self.processor.table.clone(),
        }))
    }

    async fn delete_processed(&self) -> Result<u64, StoreError> {
        let deleted = self.processor.process(DeleteProcessedEvents).await?;
        Ok(deleted)
    }
}

#[async_trait]
impl OutboxTransaction for TransactionProcessor<'static> {
    async fn claim_for_update(&mut self, id: i64) -> Result<Option<OutboxEvent>, StoreError> {
        Ok(OutboxEvent::claim_for_update_tx(self, id).await?)
    }

    async fn mark_processed(&mut self, id: i64) -> Result<(), StoreError> {
        match OutboxEvent::mark_processed_tx(self, id).await? {
            0 => Err(StoreError::NotClaimed(id)),
            _ => Ok(()),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.rollback().await?;
        Ok(())
    }
}
