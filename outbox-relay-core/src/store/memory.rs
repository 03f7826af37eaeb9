//! In-memory outbox store.
//!
//! Mirrors the Postgres locking semantics: a claimed row is invisible to
//! polls and to other claims until its transaction commits or rolls back.
//! Failures can be injected per operation so retry paths can be exercised
//! without a database.

use super::{OutboxStore, OutboxTransaction, StoreError};
use crate::entities::OutboxEvent;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const INJECTED_FAILURE: &str = "injected failure";

#[derive(Debug, Clone)]
struct MemoryRow {
    payload: serde_json::Value,
    is_processed: bool,
    created_at: time::OffsetDateTime,
}

#[derive(Debug, Default)]
struct InjectedFailures {
    polls: u32,
    begins: u32,
    commits: u32,
    deletes: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_id: i64,
    next_tx: u64,
    rows: BTreeMap<i64, MemoryRow>,
    /// event id -> id of the transaction holding the row lock
    locks: HashMap<i64, u64>,
    failures: InjectedFailures,
}

impl MemoryState {
    fn event(&self, id: i64) -> Option<OutboxEvent> {
        self.rows.get(&id).map(|row| OutboxEvent {
            id,
            payload: row.payload.clone(),
            is_processed: row.is_processed,
            created_at: row.created_at,
        })
    }

    fn release(&mut self, tx_id: u64) {
        self.locks.retain(|_, holder| *holder != tx_id);
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

/// Outbox store held entirely in memory.
///
/// Cloning shares the underlying table.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutboxStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an unprocessed event and return its id.
    pub fn insert(&self, payload: serde_json::Value) -> i64 {
        self.insert_row(payload, false)
    }

    /// Insert an event that is already marked processed.
    pub fn insert_processed(&self, payload: serde_json::Value) -> i64 {
        self.insert_row(payload, true)
    }

    fn insert_row(&self, payload: serde_json::Value, is_processed: bool) -> i64 {
        let mut state = self.state();
        state.last_id += 1;
        let id = state.last_id;
        state.rows.insert(
            id,
            MemoryRow {
                payload,
                is_processed,
                created_at: time::OffsetDateTime::now_utc(),
            },
        );
        id
    }

    pub fn event(&self, id: i64) -> Option<OutboxEvent> {
        self.state().event(id)
    }

    pub fn len(&self) -> usize {
        self.state().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().rows.is_empty()
    }

    pub fn processed_count(&self) -> usize {
        self.state().rows.values().filter(|r| r.is_processed).count()
    }

    pub fn unprocessed_count(&self) -> usize {
        self.state().rows.values().filter(|r| !r.is_processed).count()
    }

    /// Ids currently locked by an open transaction.
    pub fn locked_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.state().locks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Make the next `count` polls fail.
    pub fn fail_next_polls(&self, count: u32) {
        self.state().failures.polls = count;
    }

    /// Make the next `count` transaction begins fail.
    pub fn fail_next_begins(&self, count: u32) {
        self.state().failures.begins = count;
    }

    /// Make the next `count` commits fail. A failed commit discards the
    /// transaction's writes and releases its claims.
    pub fn fail_next_commits(&self, count: u32) {
        self.state().failures.commits = count;
    }

    /// Make the next `count` deletes fail.
    pub fn fail_next_deletes(&self, count: u32) {
        self.state().failures.deletes = count;
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn poll_unprocessed(&self, limit: u32) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut state = self.state();
        if take_failure(&mut state.failures.polls) {
            return Err(StoreError::Unavailable(INJECTED_FAILURE.to_string()));
        }

        let events = state
            .rows
            .iter()
            .filter(|(id, row)| !row.is_processed && !state.locks.contains_key(*id))
            .take(limit as usize)
            .map(|(id, row)| OutboxEvent {
                id: *id,
                payload: row.payload.clone(),
                is_processed: row.is_processed,
                created_at: row.created_at,
            })
            .collect();
        Ok(events)
    }

    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, StoreError> {
        let mut state = self.state();
        if take_failure(&mut state.failures.begins) {
            return Err(StoreError::Unavailable(INJECTED_FAILURE.to_string()));
        }

        state.next_tx += 1;
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            tx_id: state.next_tx,
            claimed: Vec::new(),
            marked: Vec::new(),
            finished: false,
        }))
    }

    async fn delete_processed(&self) -> Result<u64, StoreError> {
        let mut state = self.state();
        if take_failure(&mut state.failures.deletes) {
            return Err(StoreError::Unavailable(INJECTED_FAILURE.to_string()));
        }

        let before = state.rows.len();
        state.rows.retain(|_, row| !row.is_processed);
        Ok((before - state.rows.len()) as u64)
    }
}

/// Transaction over a [`MemoryOutboxStore`].
///
/// Writes are staged and applied on commit.
struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    tx_id: u64,
    claimed: Vec<i64>,
    marked: Vec<i64>,
    finished: bool,
}

impl MemoryTransaction {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl OutboxTransaction for MemoryTransaction {
    async fn claim_for_update(&mut self, id: i64) -> Result<Option<OutboxEvent>, StoreError> {
        let tx_id = self.tx_id;
        let claimed = {
            let mut state = self.state();
            let available = state.rows.get(&id).is_some_and(|row| !row.is_processed);
            let holder = state.locks.get(&id).copied();
            match (available, holder) {
                (true, None) => {
                    state.locks.insert(id, tx_id);
                    state.event(id)
                }
                (true, Some(holder)) if holder == tx_id => state.event(id),
                _ => None,
            }
        };

        if claimed.is_some() && !self.claimed.contains(&id) {
            self.claimed.push(id);
        }
        Ok(claimed)
    }

    async fn mark_processed(&mut self, id: i64) -> Result<(), StoreError> {
        if !self.claimed.contains(&id) {
            return Err(StoreError::NotClaimed(id));
        }
        if !self.marked.contains(&id) {
            self.marked.push(id);
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finished = true;
        let tx_id = self.tx_id;
        let mut state = self.state();

        if take_failure(&mut state.failures.commits) {
            state.release(tx_id);
            return Err(StoreError::Unavailable(INJECTED_FAILURE.to_string()));
        }

        for id in &self.marked {
            if let Some(row) = state.rows.get_mut(id) {
                row.is_processed = true;
            }
        }
        state.release(tx_id);
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finished = true;
        let tx_id = self.tx_id;
        self.state().release(tx_id);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            let tx_id = self.tx_id;
            self.state().release(tx_id);
        }
    }
}
