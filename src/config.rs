//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a caller waits for the database before giving up.
    pub busy_timeout: Duration,
    /// Period of the background integrity check (zero disables the timer;
    /// explicit requests are still served).
    pub integrity_check_period: Duration,
    /// Period of the write-ahead-log checkpoint loop.
    pub wal_checkpoint_period: Duration,
    /// Checkpoint period used while the checkpointer is catching up.
    pub wal_checkpoint_period_fast: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(20),
            integrity_check_period: Duration::from_secs(3600), // 1 hour
            wal_checkpoint_period: Duration::from_secs(15 * 60),
            wal_checkpoint_period_fast: Duration::from_secs(15),
        }
    }
}

/// Manager process configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Path of the SQLite database file.
    pub database_path: PathBuf,
    pub store: StoreConfig,
    /// Prefix prepended to every forwarded event topic.
    pub topic_prefix: String,
    /// Maximum number of events buffered for the broker forwarder.
    pub forwarder_queue_size: usize,
    /// Time between farm status polls.
    pub farm_status_poll: Duration,
    /// AMQP URL of the message broker. Without one, events are not forwarded.
    pub broker_url: Option<String>,
    /// Topic exchange the forwarded events are published to.
    pub broker_exchange: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/farm-manager.sqlite"),
            store: StoreConfig::default(),
            topic_prefix: "flamenco".to_string(),
            forwarder_queue_size: 10,
            farm_status_poll: Duration::from_secs(5),
            broker_url: None,
            broker_exchange: "flamenco".to_string(),
        }
    }
}

impl ManagerConfig {
    /// Build the configuration from `FARM_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let database_path = std::env::var("FARM_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let store = StoreConfig {
            busy_timeout: env_secs("FARM_DB_BUSY_TIMEOUT_SECS")
                .unwrap_or(defaults.store.busy_timeout),
            integrity_check_period: env_secs("FARM_DB_CHECK_PERIOD_SECS")
                .unwrap_or(defaults.store.integrity_check_period),
            ..defaults.store
        };

        let topic_prefix =
            std::env::var("FARM_TOPIC_PREFIX").unwrap_or(defaults.topic_prefix);

        let forwarder_queue_size = std::env::var("FARM_FORWARDER_QUEUE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.forwarder_queue_size);

        Self {
            database_path,
            store,
            topic_prefix,
            forwarder_queue_size,
            farm_status_poll: env_secs("FARM_STATUS_POLL_SECS")
                .unwrap_or(defaults.farm_status_poll),
            broker_url: broker_url(std::env::var("FARM_BROKER_URL").ok()),
            broker_exchange: std::env::var("FARM_BROKER_EXCHANGE")
                .unwrap_or(defaults.broker_exchange),
        }
    }
}

/// A blank broker URL counts as unset.
fn broker_url(raw: Option<String>) -> Option<String> {
    raw.map(|url| url.trim().to_string()).filter(|url| !url.is_empty())
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
