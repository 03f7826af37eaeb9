use outbox_relay_core::config::{OutboxGcConfig, RelayConfig};
use outbox_relay_core::limiter::ConcurrencyLimiter;
use outbox_relay_core::metrics::RelayMetrics;
use outbox_relay_core::processors::{ClaimProcessCommit, OutboxGc, RelayEngine};
use outbox_relay_core::shutdown::{ShutdownCoordinator, ShutdownError};
use outbox_relay_core::sinks::{RecordingBrokerSink, RecordingSearchSink};
use outbox_relay_core::store::{MemoryOutboxStore, OutboxStore};
use outbox_relay_core::transform::EventTransformer;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn spawn_relay(
    coordinator: &mut ShutdownCoordinator,
    store: &MemoryOutboxStore,
    broker_latency: Duration,
) -> Arc<RecordingBrokerSink> {
    let config = RelayConfig::default()
        .with_concurrency(3)
        .with_idle_delay(Duration::from_millis(20))
        .with_operation_timeout(Duration::from_secs(5));
    let metrics = Arc::new(RelayMetrics::new());
    let shared: Arc<dyn OutboxStore> = Arc::new(store.clone());
    let broker = Arc::new(RecordingBrokerSink::new().with_latency(broker_latency));

    let workflow = Arc::new(ClaimProcessCommit::new(
        shared.clone(),
        Arc::new(RecordingSearchSink::new()),
        broker.clone(),
        EventTransformer::new("events", "outbox"),
        &config,
        metrics.clone(),
    ));
    let engine = RelayEngine::new(
        shared.clone(),
        workflow,
        ConcurrencyLimiter::new(config.concurrency),
        config,
        metrics.clone(),
    );
    let gc = OutboxGc::new(shared, OutboxGcConfig::default(), metrics);

    let relay_signal = coordinator.signal();
    coordinator.spawn("relay-engine", engine.run(relay_signal));
    let gc_signal = coordinator.signal();
    coordinator.spawn("outbox-gc", gc.run(gc_signal));

    broker
}

#[tokio::test]
async fn test_idle_shutdown_completes_quickly() {
    let store = MemoryOutboxStore::new();
    let mut coordinator = ShutdownCoordinator::new();
    spawn_relay(&mut coordinator, &store, Duration::ZERO);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    coordinator.shutdown(Duration::from_secs(2)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_handlers() {
    let store = MemoryOutboxStore::new();
    for n in 0..3 {
        store.insert(json!({"event_type": "slow.job", "data": {"n": n}}));
    }
    let mut coordinator = ShutdownCoordinator::new();
    let broker = spawn_relay(&mut coordinator, &store, Duration::from_millis(400));

    // Let all three handlers claim their rows.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.locked_ids().len(), 3);
    assert!(broker.messages().is_empty());

    let started = Instant::now();
    coordinator.shutdown(Duration::from_secs(5)).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(broker.messages().len(), 3);
    assert_eq!(store.processed_count(), 3);
    assert!(store.locked_ids().is_empty());
}

#[tokio::test]
async fn test_shutdown_grace_exceeded_names_relay() {
    let store = MemoryOutboxStore::new();
    store.insert(json!({"event_type": "very.slow"}));
    let mut coordinator = ShutdownCoordinator::new();
    spawn_relay(&mut coordinator, &store, Duration::from_secs(3));

    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = coordinator
        .shutdown(Duration::from_millis(100))
        .await
        .unwrap_err();
    match err {
        ShutdownError::TimedOut { pending } => assert_eq!(pending, vec!["relay-engine"]),
        other => panic!("unexpected error: {other}"),
    }
}
