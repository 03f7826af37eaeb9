use crate::framework::{DatabaseProcessor, TransactionProcessor};
use kanau::processor::Processor;
use std::sync::Arc;
use thiserror::Error;

/// Default name of the outbox table.
pub const DEFAULT_OUTBOX_TABLE: &str = "outbox_events";

/// Postgres caps identifiers at 63 bytes.
const MAX_IDENTIFIER_LEN: usize = 63;

/// One row of the outbox table.
///
/// Rows are inserted by the producing service inside its own transaction
/// with `is_processed = false`. The relay flips the flag exactly once and
/// the GC deletes the row some time after.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OutboxEvent {
    pub id: i64,
    pub payload: serde_json::Value,
    pub is_processed: bool,
    pub created_at: time::OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid outbox table name {name:?}: {reason}")]
pub struct InvalidTableName {
    pub name: String,
    pub reason: &'static str,
}

/// A validated outbox table name together with the statements that target it.
///
/// The name is interpolated into SQL, so it is restricted to plain
/// (optionally schema-qualified) identifiers.
#[derive(Debug, Clone)]
pub struct OutboxTable {
    inner: Arc<OutboxStatements>,
}

#[derive(Debug)]
struct OutboxStatements {
    name: String,
    poll: String,
    claim: String,
    mark_processed: String,
    delete_processed: String,
}

impl OutboxTable {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidTableName> {
        let name = name.into();
        validate_table_name(&name)?;
        Ok(Self::from_validated(name))
    }

    fn from_validated(name: String) -> Self {
        let columns = "id, payload, is_processed, created_at";
        let statements = OutboxStatements {
            poll: format!(
                "SELECT {columns} FROM {name} \
                 WHERE is_processed = false \
                 ORDER BY id ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED"
            ),
            claim: format!(
                "SELECT {columns} FROM {name} \
                 WHERE id = $1 AND is_processed = false \
                 FOR UPDATE SKIP LOCKED"
            ),
            mark_processed: format!(
                "UPDATE {name} SET is_processed = true \
                 WHERE id = $1 AND is_processed = false"
            ),
            delete_processed: format!("DELETE FROM {name} WHERE is_processed = true"),
            name,
        };

        Self {
            inner: Arc::new(statements),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl Default for OutboxTable {
    fn default() -> Self {
        Self::from_validated(DEFAULT_OUTBOX_TABLE.to_string())
    }
}

impl std::fmt::Display for OutboxTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn validate_table_name(name: &str) -> Result<(), InvalidTableName> {
    let invalid = |reason| InvalidTableName {
        name: name.to_string(),
        reason,
    };

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(invalid("at most one schema qualifier is allowed"));
    }

    for part in parts {
        if part.is_empty() {
            return Err(invalid("identifier is empty"));
        }
        if part.len() > MAX_IDENTIFIER_LEN {
            return Err(invalid("identifier is longer than 63 bytes"));
        }
        let mut chars = part.chars();
        let first_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !first_ok {
            return Err(invalid("identifier must start with a letter or underscore"));
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid(
                "identifier may only contain ASCII letters, digits and underscores",
            ));
        }
    }

    Ok(())
}

#[derive(Debug, Clone)]
/// Select unprocessed events, oldest first, skipping rows locked by an
/// in-flight claim.
pub struct PollUnprocessedEvents {
    pub limit: u32,
}

impl Processor<PollUnprocessedEvents> for DatabaseProcessor {
    type Output = Vec<OutboxEvent>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:PollUnprocessedEvents")]
    async fn process(&self, query: PollUnprocessedEvents) -> Result<Vec<OutboxEvent>, sqlx::Error> {
        let events = sqlx::query_as::<_, OutboxEvent>(&self.table.inner.poll)
            .bind(i64::from(query.limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(events)
    }
}

#[derive(Debug, Clone)]
/// Delete every event already marked processed.
///
/// Returns the number of rows removed.
pub struct DeleteProcessedEvents;

impl Processor<DeleteProcessedEvents> for DatabaseProcessor {
    type Output = u64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:DeleteProcessedEvents")]
    async fn process(&self, _cmd: DeleteProcessedEvents) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(&self.table.inner.delete_processed)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

impl OutboxEvent {
    /// Lock one unprocessed event for the rest of the transaction.
    ///
    /// Returns `None` when the row is gone, already processed, or locked by
    /// another transaction.
    #[tracing::instrument(skip_all, err, name = "SQL:ClaimEventForUpdate")]
    pub async fn claim_for_update_tx(
        tx: &mut TransactionProcessor<'_>,
        id: i64,
    ) -> Result<Option<OutboxEvent>, sqlx::Error> {
        let event = sqlx::query_as::<_, OutboxEvent>(&tx.table.inner.claim)
            .bind(id)
            .fetch_optional(&mut *tx.tx)
            .await?;
        Ok(event)
    }

    /// Flip `is_processed` for a claimed event.
    ///
    /// Returns the number of rows updated, which is 1 for a held claim.
    #[tracing::instrument(skip_all, err, name = "SQL:MarkEventProcessed")]
    pub async fn mark_processed_tx(
        tx: &mut TransactionProcessor<'_>,
        id: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(&tx.table.inner.mark_processed)
            .bind(id)
            .execute(&mut *tx.tx)
            .await?;
        Ok(result.rows_affected())
    }
}
