//! Configuration module for outbox-relay-server.
//!
//! Handles loading configuration from TOML files, CLI arguments,
//! and environment variables.

pub mod file;

use crate::config::file::FileConfig;
use outbox_relay_core::config::{OutboxGcConfig, RelayConfig};
use outbox_relay_core::entities::{InvalidTableName, OutboxTable};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connections reserved beside the handlers: one for the poll loop, one for the GC.
const RESERVED_CONNECTIONS: u32 = 2;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("invalid outbox table: {0}")]
    InvalidTable(#[from] InvalidTableName),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub table: OutboxTable,
    pub max_connections: u32,
    pub max_lifetime: Duration,
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub url: Url,
    pub index: String,
    pub credentials: Option<(String, Option<String>)>,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub url: String,
    pub topic_prefix: String,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: SocketAddr,
    pub shutdown_grace: Duration,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub relay: RelayConfig,
    pub gc: OutboxGcConfig,
    pub database: DatabaseSettings,
    pub search: SearchSettings,
    pub broker: BrokerSettings,
    pub server: ServerSettings,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    /// Create a new config loader.
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    /// Load and process the configuration.
    ///
    /// This will:
    /// 1. Read the TOML file
    /// 2. Apply CLI overrides
    /// 3. Validate the configuration
    /// 4. Build the loaded configuration
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        self.load_str(&config_content)
    }

    fn load_str(&self, content: &str) -> Result<LoadedConfig, ConfigError> {
        let mut file_config: FileConfig = toml::from_str(content)?;

        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }

        validate(&file_config)?;
        build_loaded_config(file_config)
    }
}

fn validate(config: &FileConfig) -> Result<(), ConfigError> {
    let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

    if config.relay.batch_size == 0 {
        return invalid("relay.batch_size must be greater than zero".to_string());
    }
    if config.relay.concurrency == 0 {
        return invalid("relay.concurrency must be greater than zero".to_string());
    }
    if config.relay.operation_timeout_ms == 0 {
        return invalid("relay.operation_timeout_ms must be greater than zero".to_string());
    }
    if config.gc.interval_secs == 0 || config.gc.timeout_secs == 0 {
        return invalid("gc.interval_secs and gc.timeout_secs must be greater than zero".to_string());
    }

    let required = u32::try_from(config.relay.concurrency)
        .unwrap_or(u32::MAX)
        .saturating_add(RESERVED_CONNECTIONS);
    if config.database.max_connections < required {
        return invalid(format!(
            "database.max_connections is {} but relay.concurrency {} needs at least {}",
            config.database.max_connections, config.relay.concurrency, required
        ));
    }

    if config.search.index.trim().is_empty() {
        return invalid("search.index must not be empty".to_string());
    }
    if config.broker.topic_prefix.trim().is_empty() {
        return invalid("broker.topic_prefix must not be empty".to_string());
    }
    if config
        .broker
        .topic_prefix
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '*' | '>'))
    {
        return invalid(format!(
            "broker.topic_prefix {:?} contains wildcard or whitespace characters",
            config.broker.topic_prefix
        ));
    }

    Ok(())
}

fn build_loaded_config(file_config: FileConfig) -> Result<LoadedConfig, ConfigError> {
    let FileConfig {
        relay,
        gc,
        database,
        search,
        broker,
        server,
    } = file_config;

    let relay = RelayConfig::default()
        .with_batch_size(relay.batch_size)
        .with_concurrency(relay.concurrency)
        .with_operation_timeout(Duration::from_millis(relay.operation_timeout_ms))
        .with_idle_delay(Duration::from_millis(relay.idle_delay_ms))
        .with_immediate_retries(relay.immediate_retries)
        .with_backpressure_wait(Duration::from_millis(relay.backpressure_wait_ms));

    let gc = OutboxGcConfig::default()
        .with_interval(Duration::from_secs(gc.interval_secs))
        .with_timeout(Duration::from_secs(gc.timeout_secs))
        .with_retries(gc.retries);

    Ok(LoadedConfig {
        relay,
        gc,
        database: DatabaseSettings {
            table: OutboxTable::new(&database.table)?,
            max_connections: database.max_connections,
            max_lifetime: Duration::from_secs(database.max_lifetime_secs),
        },
        search: SearchSettings {
            url: search.url,
            index: search.index,
            credentials: search.username.map(|user| (user, search.password)),
        },
        broker: BrokerSettings {
            url: broker.url,
            topic_prefix: broker.topic_prefix,
        },
        server: ServerSettings {
            listen: server.listen,
            shutdown_grace: Duration::from_secs(server.shutdown_grace_secs),
        },
    })
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[search]
url = "http://localhost:9200"

[broker]
url = "nats://localhost:4222"
"#;

    fn load(extra: &str) -> Result<LoadedConfig, ConfigError> {
        ConfigLoader::new("unused.toml", None).load_str(&format!("{extra}\n{BASE}"))
    }

    #[test]
    fn test_defaults_convert_to_core_configs() {
        let config = load("").unwrap();
        assert_eq!(config.relay, RelayConfig::default());
        assert_eq!(config.gc, OutboxGcConfig::default());
        assert_eq!(config.database.table.name(), "outbox_events");
        assert_eq!(config.server.shutdown_grace, Duration::from_secs(30));
        assert!(config.search.credentials.is_none());
    }

    #[test]
    fn test_pool_must_cover_concurrency() {
        let err = load("[relay]\nconcurrency = 20\n[database]\nmax_connections = 21\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let config = load("[relay]\nconcurrency = 20\n[database]\nmax_connections = 22\n").unwrap();
        assert_eq!(config.relay.concurrency, 20);
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(matches!(
            load("[relay]\nbatch_size = 0\n").unwrap_err(),
            ConfigError::ValidationError(_)
        ));
        assert!(matches!(
            load("[relay]\nconcurrency = 0\n").unwrap_err(),
            ConfigError::ValidationError(_)
        ));
    }

    #[test]
    fn test_invalid_table_rejected() {
        let err = load("[database]\ntable = \"outbox; DROP TABLE users\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTable(_)));
    }

    #[test]
    fn test_wildcard_topic_prefix_rejected() {
        let content = r#"
[search]
url = "http://localhost:9200"

[broker]
url = "nats://localhost:4222"
topic_prefix = "outbox.>"
"#;
        let err = ConfigLoader::new("unused.toml", None)
            .load_str(content)
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_listen_override_applied() {
        let listen: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let config = ConfigLoader::new("unused.toml", Some(listen))
            .load_str(BASE)
            .unwrap();
        assert_eq!(config.server.listen, listen);
    }
}
