//! Relay counters.
//!
//! Plain atomics shared by the relay engine, the workflow and the GC.
//! `snapshot()` gives a consistent-enough copy for the metrics endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RelayMetrics {
    polls: AtomicU64,
    poll_failures: AtomicU64,
    dispatched: AtomicU64,
    processed: AtomicU64,
    race_lost: AtomicU64,
    transform_failures: AtomicU64,
    sink_failures: AtomicU64,
    store_failures: AtomicU64,
    commit_failures: AtomicU64,
    abandoned_on_shutdown: AtomicU64,
    gc_sweeps: AtomicU64,
    gc_rows_deleted: AtomicU64,
    gc_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub polls: u64,
    pub poll_failures: u64,
    pub dispatched: u64,
    pub processed: u64,
    pub race_lost: u64,
    pub transform_failures: u64,
    pub sink_failures: u64,
    pub store_failures: u64,
    pub commit_failures: u64,
    pub abandoned_on_shutdown: u64,
    pub gc_sweeps: u64,
    pub gc_rows_deleted: u64,
    pub gc_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_poll(&self) {
        bump(&self.polls);
    }

    pub fn record_poll_failure(&self) {
        bump(&self.poll_failures);
    }

    pub fn record_dispatched(&self) {
        bump(&self.dispatched);
    }

    pub fn record_processed(&self) {
        bump(&self.processed);
    }

    pub fn record_race_lost(&self) {
        bump(&self.race_lost);
    }

    pub fn record_transform_failure(&self) {
        bump(&self.transform_failures);
    }

    pub fn record_sink_failure(&self) {
        bump(&self.sink_failures);
    }

    pub fn record_store_failure(&self) {
        bump(&self.store_failures);
    }

    pub fn record_commit_failure(&self) {
        bump(&self.commit_failures);
    }

    /// Events left undispatched because shutdown began.
    pub fn record_abandoned(&self, count: u64) {
        self.abandoned_on_shutdown
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_gc_sweep(&self, deleted: u64) {
        bump(&self.gc_sweeps);
        self.gc_rows_deleted.fetch_add(deleted, Ordering::Relaxed);
    }

    pub fn record_gc_failure(&self) {
        bump(&self.gc_failures);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            polls: load(&self.polls),
            poll_failures: load(&self.poll_failures),
            dispatched: load(&self.dispatched),
            processed: load(&self.processed),
            race_lost: load(&self.race_lost),
            transform_failures: load(&self.transform_failures),
            sink_failures: load(&self.sink_failures),
            store_failures: load(&self.store_failures),
            commit_failures: load(&self.commit_failures),
            abandoned_on_shutdown: load(&self.abandoned_on_shutdown),
            gc_sweeps: load(&self.gc_sweeps),
            gc_rows_deleted: load(&self.gc_rows_deleted),
            gc_failures: load(&self.gc_failures),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = RelayMetrics::new();
        metrics.record_poll();
        metrics.record_poll();
        metrics.record_processed();
        metrics.record_gc_sweep(7);
        metrics.record_gc_sweep(0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.polls, 2);
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.gc_sweeps, 2);
        assert_eq!(snapshot.gc_rows_deleted, 7);
        assert_eq!(snapshot.race_lost, 0);
    }
}
