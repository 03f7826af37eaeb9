//! Axum server setup and router configuration.

use crate::state::AppState;
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use outbox_relay_core::metrics::MetricsSnapshot;
use outbox_relay_core::processors::GcState;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Build the main application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    database: &'static str,
}

/// Returns 200 while the pool is open, 503 once it has been closed.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (code, status, database) = if state.db.is_closed() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down", "closed")
    } else {
        (StatusCode::OK, "healthy", "open")
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            database,
        }),
    )
}

#[derive(Serialize)]
struct MetricsResponse {
    #[serde(flatten)]
    counters: MetricsSnapshot,
    in_flight: usize,
    concurrency: usize,
    gc_state: &'static str,
    pool_size: u32,
    pool_idle: usize,
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    let gc_state = match *state.gc_state.borrow() {
        GcState::Idle => "idle",
        GcState::Running => "running",
        GcState::Retrying => "retrying",
    };

    Json(MetricsResponse {
        counters: state.metrics.snapshot(),
        in_flight: state.limiter.capacity() - state.limiter.available(),
        concurrency: state.limiter.capacity(),
        gc_state,
        pool_size: state.db.size(),
        pool_idle: state.db.num_idle(),
    })
}

/// Run the server until `shutdown` resolves.
pub async fn run_server(
    router: Router,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
