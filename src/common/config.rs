//! Configuration for shardkv servers and clients

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix, e.g. `SHARDKV__SERVER__REQUEST_TIMEOUT_MS=800`
const ENV_PREFIX: &str = "SHARDKV";

/// Top-level configuration file layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply `SHARDKV__*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.server.validate()?;
        config.client.validate()?;
        Ok(config)
    }
}

/// Replica server configuration. Every replica of a group must use the same
/// `outbound_retention`, since it influences applied state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// How long an RPC handler waits for its command to be applied
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Configuration poll interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How often the migration driver scans for pending inbound shards
    #[serde(default = "default_migration_interval")]
    pub migration_interval_ms: u64,

    /// Initial back-off between failed pull rounds
    #[serde(default = "default_pull_backoff")]
    pub pull_backoff_ms: u64,

    /// Back-off cap for pull retries
    #[serde(default = "default_pull_backoff_max")]
    pub pull_backoff_max_ms: u64,

    /// Snapshot once the consensus log grows beyond this many bytes
    #[serde(default)]
    pub max_raft_state: Option<usize>,

    /// Discard outbound shard content this many configurations after it
    /// stopped being owned. `None` keeps it until overwritten.
    #[serde(default)]
    pub outbound_retention: Option<u64>,
}

fn default_request_timeout() -> u64 {
    500
}
fn default_poll_interval() -> u64 {
    100
}
fn default_migration_interval() -> u64 {
    50
}
fn default_pull_backoff() -> u64 {
    20
}
fn default_pull_backoff_max() -> u64 {
    1_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            poll_interval_ms: default_poll_interval(),
            migration_interval_ms: default_migration_interval(),
            pull_backoff_ms: default_pull_backoff(),
            pull_backoff_max_ms: default_pull_backoff_max(),
            max_raft_state: None,
            outbound_retention: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig("request_timeout_ms must be > 0".into()));
        }
        if self.poll_interval_ms == 0 || self.migration_interval_ms == 0 {
            return Err(Error::InvalidConfig("tick intervals must be > 0".into()));
        }
        if self.pull_backoff_ms > self.pull_backoff_max_ms {
            return Err(Error::InvalidConfig(
                "pull_backoff_ms exceeds pull_backoff_max_ms".into(),
            ));
        }
        if self.outbound_retention == Some(0) {
            return Err(Error::InvalidConfig("outbound_retention must be >= 1".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn migration_interval(&self) -> Duration {
        Duration::from_millis(self.migration_interval_ms)
    }
}

/// Client (clerk) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Pause between full retry rounds of a Get
    #[serde(default = "default_get_backoff")]
    pub get_backoff_ms: u64,

    /// Pause between full retry rounds of a Put/Append
    #[serde(default = "default_put_backoff")]
    pub put_append_backoff_ms: u64,
}

fn default_get_backoff() -> u64 {
    100
}
fn default_put_backoff() -> u64 {
    300
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            get_backoff_ms: default_get_backoff(),
            put_append_backoff_ms: default_put_backoff(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.get_backoff_ms == 0 || self.put_append_backoff_ms == 0 {
            return Err(Error::InvalidConfig("client back-off must be > 0".into()));
        }
        Ok(())
    }
}
