//! RelayEngine processor.
//!
//! The RelayEngine is responsible for:
//! - Polling the outbox for unprocessed events in id order
//! - Dispatching each event to the claim-process-commit workflow as its
//!   own task, gated by the concurrency limiter
//! - Idling for a fixed delay when a poll comes back empty, short or fails
//! - Stopping before the next poll on shutdown and draining in-flight
//!   handlers before returning

use super::workflow::ClaimProcessCommit;
use crate::config::RelayConfig;
use crate::entities::OutboxEvent;
use crate::limiter::ConcurrencyLimiter;
use crate::metrics::RelayMetrics;
use crate::shutdown::ShutdownSignal;
use crate::store::{OutboxStore, with_deadline};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};

/// Ids of events dispatched by this engine whose handler has not finished.
///
/// A poll can return an event whose handler is queued but has not claimed
/// the row yet; the engine skips such ids instead of dispatching them twice.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<i64>>>,
}

/// Removes its id from the in-flight set when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<i64>>>,
    id: i64,
}

impl InFlight {
    fn ids(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `id` in flight. `None` if it already is.
    pub fn track(&self, id: i64) -> Option<InFlightGuard> {
        self.ids().insert(id).then(|| InFlightGuard {
            ids: Arc::clone(&self.ids),
            id,
        })
    }

    fn contains(&self, id: i64) -> bool {
        self.ids().contains(&id)
    }

    fn is_empty(&self) -> bool {
        self.ids().is_empty()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Continuous poll/dispatch loop over the outbox.
pub struct RelayEngine {
    store: Arc<dyn OutboxStore>,
    workflow: Arc<ClaimProcessCommit>,
    limiter: ConcurrencyLimiter,
    config: RelayConfig,
    metrics: Arc<RelayMetrics>,
    in_flight: InFlight,
}

impl RelayEngine {
    /// Create a new RelayEngine.
    ///
    /// # Arguments
    ///
    /// * `store` - Outbox store to poll
    /// * `workflow` - Handler run for every dispatched event
    /// * `limiter` - Admission gate bounding concurrent handlers
    /// * `config` - Poll and timing settings
    /// * `metrics` - Shared counters
    pub fn new(
        store: Arc<dyn OutboxStore>,
        workflow: Arc<ClaimProcessCommit>,
        limiter: ConcurrencyLimiter,
        config: RelayConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            store,
            workflow,
            limiter,
            config,
            metrics,
            in_flight: InFlight::default(),
        }
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Run the RelayEngine until shutdown.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        info!(
            batch_size = self.config.batch_size,
            concurrency = self.limiter.capacity(),
            "RelayEngine started"
        );

        let mut handlers = JoinSet::new();

        loop {
            while let Some(result) = handlers.try_join_next() {
                log_handler_exit(result);
            }

            if shutdown.is_triggered() {
                info!("RelayEngine received shutdown signal");
                break;
            }

            let events = self.poll().await;
            let drained = events.len() < self.config.batch_size as usize;
            let dispatched = self.dispatch(events, &mut shutdown, &mut handlers).await;

            // A short batch means the backlog is empty for now.
            if dispatched == 0 || drained {
                tokio::select! {
                    biased;

                    _ = shutdown.triggered() => {
                        info!("RelayEngine received shutdown signal");
                        break;
                    }

                    _ = tokio::time::sleep(self.config.idle_delay) => {}
                }
            }
        }

        if !handlers.is_empty() {
            info!(in_flight = handlers.len(), "RelayEngine draining in-flight handlers");
        }
        while let Some(result) = handlers.join_next().await {
            log_handler_exit(result);
        }

        info!("RelayEngine shutdown complete");
    }

    /// Poll once, dispatch the batch and wait for every handler to finish.
    ///
    /// Returns the number of dispatched events.
    pub async fn run_once(&self, shutdown: &mut ShutdownSignal) -> usize {
        let mut handlers = JoinSet::new();
        let events = self.poll().await;
        let dispatched = self.dispatch(events, shutdown, &mut handlers).await;
        while let Some(result) = handlers.join_next().await {
            log_handler_exit(result);
        }
        dispatched
    }

    /// Fetch the next batch. Failures are logged and yield an empty batch.
    async fn poll(&self) -> Vec<OutboxEvent> {
        self.metrics.record_poll();
        let result = with_deadline(
            "poll_unprocessed",
            self.config.operation_timeout,
            self.store.poll_unprocessed(self.config.batch_size),
        )
        .await;

        match result {
            Ok(events) => {
                if !events.is_empty() {
                    debug!(count = events.len(), "Polled unprocessed events");
                }
                events
            }
            Err(e) => {
                self.metrics.record_poll_failure();
                error!(error = %e, "Failed to poll outbox");
                Vec::new()
            }
        }
    }

    /// Spawn a handler per event, blocking while the limiter is full.
    async fn dispatch(
        &self,
        events: Vec<OutboxEvent>,
        shutdown: &mut ShutdownSignal,
        handlers: &mut JoinSet<()>,
    ) -> usize {
        let mut dispatched = 0;
        let mut events = events.into_iter();

        while let Some(event) = events.next() {
            let event_id = event.id;
            let Some(guard) = self.in_flight.track(event_id) else {
                debug!(event_id, "Event already in flight, skipping");
                continue;
            };

            let permit = match self.limiter.acquire(shutdown).await {
                Ok(permit) => permit,
                Err(e) => {
                    // Ids still owned by a running handler would have been skipped.
                    let abandoned = 1 + events
                        .by_ref()
                        .filter(|rest| !self.in_flight.contains(rest.id))
                        .count();
                    self.metrics.record_abandoned(abandoned as u64);
                    info!(abandoned, reason = %e, "Stopped dispatching batch");
                    break;
                }
            };

            let workflow = Arc::clone(&self.workflow);
            handlers.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                match workflow.run(event_id).await {
                    Ok(outcome) => debug!(event_id, ?outcome, "Event handled"),
                    Err(e) => debug!(event_id, error = %e, "Event handler failed"),
                }
            });
            self.metrics.record_dispatched();
            dispatched += 1;
        }

        dispatched
    }
}

fn log_handler_exit(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Event handler task did not complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownCoordinator;
    use crate::sinks::{
        BrokerMessage, BrokerSink, Document, RecordingBrokerSink, RecordingSearchSink,
        SearchSink, SinkError,
    };
    use crate::store::MemoryOutboxStore;
    use crate::transform::EventTransformer;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Search sink that tracks how many calls overlap.
    #[derive(Default)]
    struct ConcurrencyProbe {
        running: AtomicUsize,
        max_seen: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchSink for ConcurrencyProbe {
        async fn index(&self, _document: &Document) -> Result<(), SinkError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine(
        store: &MemoryOutboxStore,
        search: Arc<dyn SearchSink>,
        broker: Arc<dyn BrokerSink>,
        config: RelayConfig,
        metrics: Arc<RelayMetrics>,
    ) -> RelayEngine {
        let store: Arc<dyn OutboxStore> = Arc::new(store.clone());
        let workflow = Arc::new(ClaimProcessCommit::new(
            store.clone(),
            search,
            broker,
            EventTransformer::new("events", "outbox"),
            &config,
            metrics.clone(),
        ));
        let limiter = ConcurrencyLimiter::new(config.concurrency);
        RelayEngine::new(store, workflow, limiter, config, metrics)
    }

    fn payload(n: usize) -> serde_json::Value {
        json!({"event_type": "item.added", "aggregate_id": format!("item-{n}"), "data": {"n": n}})
    }

    #[tokio::test]
    async fn test_run_once_processes_batch() {
        let store = MemoryOutboxStore::new();
        for n in 0..5 {
            store.insert(payload(n));
        }
        let broker = Arc::new(RecordingBrokerSink::new());
        let metrics = Arc::new(RelayMetrics::new());
        let engine = engine(
            &store,
            Arc::new(RecordingSearchSink::new()),
            broker.clone(),
            RelayConfig::default(),
            metrics.clone(),
        );
        let coordinator = ShutdownCoordinator::new();

        let dispatched = engine.run_once(&mut coordinator.signal()).await;

        assert_eq!(dispatched, 5);
        assert_eq!(store.processed_count(), 5);
        assert_eq!(broker.messages().len(), 5);
        assert!(engine.in_flight().is_empty());
        assert_eq!(engine.limiter().available(), engine.limiter().capacity());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dispatched, 5);
        assert_eq!(snapshot.processed, 5);
    }

    #[tokio::test]
    async fn test_limiter_caps_concurrent_handlers() {
        const CAPACITY: usize = 3;
        let store = MemoryOutboxStore::new();
        for n in 0..CAPACITY * 5 {
            store.insert(payload(n));
        }
        let probe = Arc::new(ConcurrencyProbe::default());
        let engine = engine(
            &store,
            probe.clone(),
            Arc::new(RecordingBrokerSink::new()),
            RelayConfig::default()
                .with_concurrency(CAPACITY)
                .with_batch_size((CAPACITY * 5) as u32),
            Arc::new(RelayMetrics::new()),
        );
        let coordinator = ShutdownCoordinator::new();

        engine.run_once(&mut coordinator.signal()).await;

        assert_eq!(probe.calls.load(Ordering::SeqCst), CAPACITY * 5);
        assert!(probe.max_seen.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(store.processed_count(), CAPACITY * 5);
    }

    #[tokio::test]
    async fn test_dispatch_stops_on_shutdown() {
        let store = MemoryOutboxStore::new();
        for n in 0..4 {
            store.insert(payload(n));
        }
        let metrics = Arc::new(RelayMetrics::new());
        let engine = engine(
            &store,
            Arc::new(RecordingSearchSink::new()),
            Arc::new(RecordingBrokerSink::new()),
            RelayConfig::default(),
            metrics.clone(),
        );
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger();

        let dispatched = engine.run_once(&mut coordinator.signal()).await;

        assert_eq!(dispatched, 0);
        assert_eq!(store.unprocessed_count(), 4);
        assert_eq!(metrics.snapshot().abandoned_on_shutdown, 4);
        assert!(engine.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_count_skips_ids_already_in_flight() {
        let store = MemoryOutboxStore::new();
        let ids: Vec<i64> = (0..4).map(|n| store.insert(payload(n))).collect();
        let metrics = Arc::new(RelayMetrics::new());
        let engine = engine(
            &store,
            Arc::new(RecordingSearchSink::new()),
            Arc::new(RecordingBrokerSink::new()),
            RelayConfig::default(),
            metrics.clone(),
        );
        let _second = engine.in_flight().track(ids[1]).unwrap();
        let _fourth = engine.in_flight().track(ids[3]).unwrap();
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger();

        let dispatched = engine.run_once(&mut coordinator.signal()).await;

        assert_eq!(dispatched, 0);
        assert_eq!(metrics.snapshot().abandoned_on_shutdown, 2);
        assert!(engine.in_flight().contains(ids[1]));
        assert!(!engine.in_flight().contains(ids[0]));
    }

    #[tokio::test]
    async fn test_poll_failures_are_not_fatal() {
        let store = MemoryOutboxStore::new();
        store.insert(payload(1));
        store.fail_next_polls(2);
        let metrics = Arc::new(RelayMetrics::new());
        let engine = engine(
            &store,
            Arc::new(RecordingSearchSink::new()),
            Arc::new(RecordingBrokerSink::new()),
            RelayConfig::default().with_idle_delay(Duration::from_millis(10)),
            metrics.clone(),
        );

        let mut coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();
        coordinator.spawn("relay", engine.run(signal));

        tokio::time::sleep(Duration::from_millis(200)).await;
        coordinator.shutdown(Duration::from_secs(2)).await.unwrap();

        assert_eq!(store.processed_count(), 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.poll_failures, 2);
        assert!(snapshot.polls >= 3);
    }

    #[tokio::test]
    async fn test_running_engine_delivers_each_event_once() {
        let store = MemoryOutboxStore::new();
        for n in 0..6 {
            store.insert(payload(n));
        }
        let broker = Arc::new(RecordingBrokerSink::new().with_latency(Duration::from_millis(30)));
        let metrics = Arc::new(RelayMetrics::new());
        let engine = engine(
            &store,
            Arc::new(RecordingSearchSink::new()),
            broker.clone(),
            RelayConfig::default()
                .with_concurrency(2)
                .with_idle_delay(Duration::from_millis(5)),
            metrics.clone(),
        );

        let mut coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();
        coordinator.spawn("relay", engine.run(signal));

        tokio::time::sleep(Duration::from_millis(400)).await;
        coordinator.shutdown(Duration::from_secs(2)).await.unwrap();

        let messages: Vec<BrokerMessage> = broker.messages();
        let unique: HashSet<String> = messages.iter().map(|m| m.dedup_id.clone()).collect();
        assert_eq!(messages.len(), 6);
        assert_eq!(unique.len(), 6);
        assert_eq!(store.processed_count(), 6);
        assert_eq!(metrics.snapshot().dispatched, 6);
    }

    #[test]
    fn test_in_flight_tracking() {
        let in_flight = InFlight::default();
        let guard = in_flight.track(7).unwrap();
        assert!(in_flight.track(7).is_none());
        assert!(in_flight.contains(7));
        drop(guard);
        assert!(!in_flight.contains(7));
        assert!(in_flight.track(7).is_some());
    }
}
