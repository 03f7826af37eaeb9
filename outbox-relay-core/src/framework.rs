use crate::entities::OutboxTable;
use sqlx::PgPool;

/// Runs pool-level queries against one outbox table.
#[derive(Debug, Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
    pub table: OutboxTable,
}

/// Runs queries inside one open transaction against one outbox table.
///
/// Dropping it without calling `commit` rolls the transaction back.
pub struct TransactionProcessor<'b> {
    pub tx: sqlx::Transaction<'b, sqlx::Postgres>,
    pub table: OutboxTable,
}
