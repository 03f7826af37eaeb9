//! Application state shared across all request handlers.

use outbox_relay_core::limiter::ConcurrencyLimiter;
use outbox_relay_core::metrics::RelayMetrics;
use outbox_relay_core::processors::GcState;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::watch;

/// Application state that is shared across all request handlers.
///
/// This is cloneable and cheap to pass around (everything is behind Arc).
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: PgPool,
    /// Relay counters.
    pub metrics: Arc<RelayMetrics>,
    /// Handler admission gate, for in-flight reporting.
    pub limiter: ConcurrencyLimiter,
    /// Current state of the outbox GC.
    pub gc_state: watch::Receiver<GcState>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        metrics: Arc<RelayMetrics>,
        limiter: ConcurrencyLimiter,
        gc_state: watch::Receiver<GcState>,
    ) -> Self {
        Self {
            db,
            metrics,
            limiter,
            gc_state,
        }
    }
}
