//! TOML file configuration structures.
//!
//! These structs directly map to the `outbox-relay.toml` file format.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub gc: GcSection,
    #[serde(default)]
    pub database: DatabaseSection,
    pub search: SearchSection,
    pub broker: BrokerSection,
    #[serde(default)]
    pub server: ServerSection,
}

/// Relay engine section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub batch_size: u32,
    pub concurrency: usize,
    /// Deadline for every store and sink call.
    pub operation_timeout_ms: u64,
    /// Pause after an empty or failed poll.
    pub idle_delay_ms: u64,
    pub immediate_retries: u32,
    pub backpressure_wait_ms: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 10,
            operation_timeout_ms: 5_000,
            idle_delay_ms: 1_000,
            immediate_retries: 0,
            backpressure_wait_ms: 1_000,
        }
    }
}

/// Outbox GC section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcSection {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
}

impl Default for GcSection {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            timeout_secs: 10,
            retries: 3,
        }
    }
}

/// Database section. The connection URL comes from `DATABASE_URL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Outbox table, optionally schema-qualified.
    pub table: String,
    /// Must leave room for every handler plus the poll loop and the GC.
    pub max_connections: u32,
    pub max_lifetime_secs: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            table: outbox_relay_core::entities::outbox_event::DEFAULT_OUTBOX_TABLE.to_string(),
            max_connections: 12,
            max_lifetime_secs: 1_800,
        }
    }
}

/// Search index (Elasticsearch-compatible) section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSection {
    /// Base URL of the cluster, e.g. `http://localhost:9200`.
    pub url: Url,
    #[serde(default = "default_index")]
    pub index: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_index() -> String {
    "outbox-events".to_string()
}

/// Message broker (NATS JetStream) section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    /// e.g. `nats://localhost:4222`.
    pub url: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_topic_prefix() -> String {
    "outbox".to_string()
}

/// HTTP server section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// The address and port to listen on (e.g., "0.0.0.0:8080").
    pub listen: SocketAddr,
    /// How long shutdown waits for in-flight events to finish.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            shutdown_grace_secs: 30,
        }
    }
}
