//! OutboxGc processor.
//!
//! Deletes outbox rows that are already marked processed. Runs on its own
//! timer, independent of the relay engine:
//!
//! - Waits a fixed interval, measured from the end of the previous sweep
//! - Deletes every processed row, bounded by a timeout
//! - On failure, retries right away up to the configured count, then gives
//!   up until the next interval
//!
//! The current [`GcState`] can be observed through a `watch` receiver.

use crate::config::OutboxGcConfig;
use crate::metrics::RelayMetrics;
use crate::shutdown::ShutdownSignal;
use crate::store::{OutboxStore, StoreError, with_deadline};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    /// Waiting for the next interval
    Idle,
    /// First delete attempt in progress
    Running,
    /// A delete failed and is being retried
    Retrying,
}

/// How a sweep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Swept { deleted: u64, attempts: u32 },
    /// Every attempt failed; the rows stay until the next sweep
    Exhausted { attempts: u32 },
}

pub struct OutboxGc {
    store: Arc<dyn OutboxStore>,
    config: OutboxGcConfig,
    metrics: Arc<RelayMetrics>,
    state: watch::Sender<GcState>,
}

impl OutboxGc {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        config: OutboxGcConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(GcState::Idle);
        Self {
            store,
            config,
            metrics,
            state,
        }
    }

    pub fn state(&self) -> GcState {
        *self.state.borrow()
    }

    /// Receiver that follows state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<GcState> {
        self.state.subscribe()
    }

    /// Delete processed rows, retrying failed attempts without delay.
    pub async fn sweep(&self) -> SweepOutcome {
        self.state.send_replace(GcState::Running);
        let max_attempts = self.config.retries.saturating_add(1);
        let mut attempts = 0;

        let outcome = loop {
            attempts += 1;
            match self.sweep_once().await {
                Ok(deleted) => {
                    self.metrics.record_gc_sweep(deleted);
                    info!(deleted, attempts, "Outbox GC swept processed events");
                    break SweepOutcome::Swept { deleted, attempts };
                }
                Err(e) => {
                    self.metrics.record_gc_failure();
                    warn!(attempt = attempts, error = %e, "Outbox GC sweep failed");
                    if attempts >= max_attempts {
                        error!(attempts, "Outbox GC retries exhausted, waiting for next interval");
                        break SweepOutcome::Exhausted { attempts };
                    }
                    self.state.send_replace(GcState::Retrying);
                }
            }
        };

        self.state.send_replace(GcState::Idle);
        outcome
    }

    /// A single delete attempt bounded by the configured timeout.
    pub async fn sweep_once(&self) -> Result<u64, StoreError> {
        with_deadline(
            "delete_processed",
            self.config.timeout,
            self.store.delete_processed(),
        )
        .await
    }

    /// Run the OutboxGc until shutdown.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        info!(
            interval = ?self.config.interval,
            retries = self.config.retries,
            "OutboxGc started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.triggered() => {
                    info!("OutboxGc received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    self.sweep().await;
                }
            }
        }

        info!("OutboxGc shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::OutboxEvent;
    use crate::shutdown::ShutdownCoordinator;
    use crate::store::{MemoryOutboxStore, OutboxTransaction};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Store whose deletes take `delay` and record when they ran.
    struct SlowDeleteStore {
        inner: MemoryOutboxStore,
        delay: Duration,
        sweeps: Mutex<Vec<(Instant, Instant)>>,
    }

    #[async_trait]
    impl OutboxStore for SlowDeleteStore {
        async fn poll_unprocessed(&self, limit: u32) -> Result<Vec<OutboxEvent>, StoreError> {
            self.inner.poll_unprocessed(limit).await
        }

        async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, StoreError> {
            self.inner.begin().await
        }

        async fn delete_processed(&self) -> Result<u64, StoreError> {
            let started = Instant::now();
            tokio::time::sleep(self.delay).await;
            let deleted = self.inner.delete_processed().await;
            self.sweeps.lock().unwrap().push((started, Instant::now()));
            deleted
        }
    }

    fn gc(store: &MemoryOutboxStore, config: OutboxGcConfig) -> (OutboxGc, Arc<RelayMetrics>) {
        let metrics = Arc::new(RelayMetrics::new());
        (
            OutboxGc::new(Arc::new(store.clone()), config, metrics.clone()),
            metrics,
        )
    }

    fn seed(store: &MemoryOutboxStore, processed: usize, unprocessed: usize) {
        for n in 0..processed {
            store.insert_processed(json!({"event_type": "done", "data": n}));
        }
        for n in 0..unprocessed {
            store.insert(json!({"event_type": "pending", "data": n}));
        }
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_processed_rows() {
        let store = MemoryOutboxStore::new();
        seed(&store, 5, 3);
        let (gc, metrics) = gc(&store, OutboxGcConfig::default());

        let outcome = gc.sweep().await;

        assert_eq!(
            outcome,
            SweepOutcome::Swept {
                deleted: 5,
                attempts: 1
            }
        );
        assert_eq!(store.len(), 3);
        assert_eq!(store.unprocessed_count(), 3);
        assert_eq!(gc.state(), GcState::Idle);
        assert_eq!(metrics.snapshot().gc_rows_deleted, 5);
    }

    #[tokio::test]
    async fn test_sweep_retries_without_delay() {
        let store = MemoryOutboxStore::new();
        seed(&store, 2, 0);
        store.fail_next_deletes(2);
        let (gc, metrics) = gc(&store, OutboxGcConfig::default().with_retries(3));

        let outcome = gc.sweep().await;

        assert_eq!(
            outcome,
            SweepOutcome::Swept {
                deleted: 2,
                attempts: 3
            }
        );
        assert!(store.is_empty());
        assert_eq!(metrics.snapshot().gc_failures, 2);
    }

    #[tokio::test]
    async fn test_sweep_gives_up_after_retries() {
        let store = MemoryOutboxStore::new();
        seed(&store, 2, 1);
        store.fail_next_deletes(10);
        let (gc, _) = gc(&store, OutboxGcConfig::default().with_retries(2));

        let outcome = gc.sweep().await;

        assert_eq!(outcome, SweepOutcome::Exhausted { attempts: 3 });
        assert_eq!(store.len(), 3);
        assert_eq!(gc.state(), GcState::Idle);
    }

    #[tokio::test]
    async fn test_state_returns_to_idle_after_retry() {
        let store = MemoryOutboxStore::new();
        store.fail_next_deletes(1);
        let (gc, _) = gc(&store, OutboxGcConfig::default());
        let mut states = gc.subscribe_state();

        gc.sweep().await;

        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), GcState::Idle);
    }

    #[tokio::test]
    async fn test_first_sweep_waits_one_interval() {
        let store = MemoryOutboxStore::new();
        seed(&store, 3, 1);
        let (gc, _) = gc(
            &store,
            OutboxGcConfig::default().with_interval(Duration::from_millis(150)),
        );

        let mut coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();
        coordinator.spawn("outbox-gc", gc.run(signal));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.len(), 4);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(store.len(), 1);

        coordinator.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_overrunning_sweep_still_waits_full_interval() {
        let interval = Duration::from_millis(100);
        let store = Arc::new(SlowDeleteStore {
            inner: MemoryOutboxStore::new(),
            delay: Duration::from_millis(250),
            sweeps: Mutex::new(Vec::new()),
        });
        let gc = OutboxGc::new(
            store.clone(),
            OutboxGcConfig::default().with_interval(interval),
            Arc::new(RelayMetrics::new()),
        );

        let mut coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();
        coordinator.spawn("outbox-gc", gc.run(signal));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        coordinator.shutdown(Duration::from_secs(2)).await.unwrap();

        let sweeps = store.sweeps.lock().unwrap().clone();
        assert!(sweeps.len() >= 2, "expected at least two sweeps, got {}", sweeps.len());
        for pair in sweeps.windows(2) {
            let (_, previous_end) = pair[0];
            let (next_start, _) = pair[1];
            assert!(next_start.duration_since(previous_end) >= interval);
        }
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_timer_wait() {
        let store = MemoryOutboxStore::new();
        let (gc, _) = gc(
            &store,
            OutboxGcConfig::default().with_interval(Duration::from_secs(3600)),
        );

        let mut coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();
        coordinator.spawn("outbox-gc", gc.run(signal));

        let started = std::time::Instant::now();
        coordinator.shutdown(Duration::from_secs(2)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
