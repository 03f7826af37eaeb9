//! Outbox Relay Server
//!
//! Relays rows from a transactional outbox table to a search index and a
//! message broker, and garbage-collects processed rows.

mod config;
mod server;
mod shutdown;
mod sinks;
mod state;

use clap::Parser;
use config::{ConfigLoader, get_database_url};
use outbox_relay_core::limiter::ConcurrencyLimiter;
use outbox_relay_core::metrics::RelayMetrics;
use outbox_relay_core::processors::{ClaimProcessCommit, OutboxGc, RelayEngine};
use outbox_relay_core::shutdown::ShutdownCoordinator;
use outbox_relay_core::store::{OutboxStore, PgOutboxStore};
use outbox_relay_core::transform::EventTransformer;
use server::{build_router, run_server};
use shutdown::shutdown_signal;
use sinks::{ElasticSearchSink, JetStreamSink};
use sqlx::postgres::PgPoolOptions;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Outbox Relay - transactional outbox to search index and message broker
#[derive(Parser, Debug)]
#[command(name = "outbox-relay-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./outbox-relay.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "OUTBOX_RELAY_LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(args.log_json);

    tracing::info!("Starting outbox-relay-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_loader = ConfigLoader::new(&args.config, args.listen);
    let config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    let database_url = get_database_url().map_err(|e| {
        tracing::error!("DATABASE_URL environment variable not set");
        e
    })?;

    // Create database connection pool
    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .max_lifetime(config.database.max_lifetime)
        .connect(&database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&db_pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                e
            })?;
        tracing::info!("Migrations completed successfully");
    }

    // Connect sinks
    let search = ElasticSearchSink::new(
        config.search.url.clone(),
        config.search.credentials.clone(),
        config.relay.operation_timeout,
    )?;
    tracing::info!(url = %config.search.url, index = %config.search.index, "Search sink ready");

    let broker = JetStreamSink::connect(&config.broker.url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to broker: {}", e);
            e
        })?;
    tracing::info!(url = %config.broker.url, "Broker connection established");

    // Wire the relay
    let metrics = Arc::new(RelayMetrics::new());
    let store: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(
        db_pool.clone(),
        config.database.table.clone(),
    ));
    let transformer = EventTransformer::new(&config.search.index, &config.broker.topic_prefix);
    let workflow = Arc::new(ClaimProcessCommit::new(
        store.clone(),
        Arc::new(search),
        Arc::new(broker),
        transformer,
        &config.relay,
        metrics.clone(),
    ));
    let limiter = ConcurrencyLimiter::new(config.relay.concurrency);
    let engine = RelayEngine::new(
        store.clone(),
        workflow,
        limiter.clone(),
        config.relay.clone(),
        metrics.clone(),
    );
    let gc = OutboxGc::new(store, config.gc.clone(), metrics.clone());

    let state = AppState::new(db_pool.clone(), metrics, limiter, gc.subscribe_state());

    let mut coordinator = ShutdownCoordinator::new();
    let relay_signal = coordinator.signal();
    coordinator.spawn("relay-engine", engine.run(relay_signal));
    let gc_signal = coordinator.signal();
    coordinator.spawn("outbox-gc", gc.run(gc_signal));

    // Run the server until SIGTERM/SIGINT
    let router = build_router(state);
    tracing::info!("Starting HTTP server on {}", config.server.listen);
    let result = run_server(router, config.server.listen, shutdown_signal()).await;

    // Stop the relay and wait for in-flight events
    if let Err(e) = coordinator.shutdown(config.server.shutdown_grace).await {
        tracing::error!("Relay did not shut down cleanly: {}", e);
    }

    // Close database connections gracefully
    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
