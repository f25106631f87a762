//! TOML-driven runtime configuration.
//!
//! Precedence: built-in defaults, then the file (explicit path or
//! `RELAYMQ_CONFIG`), then `RELAYMQ_*` environment variables.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Administrator created on first start when storage holds no users.
    pub admin_user: Option<String>,
    pub admin_password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Slice of a single dequeue wait; the worker re-checks cancellation and
    /// queue status between slices.
    pub poll_interval_ms: u64,
    /// How often a subscription whose queue vanished looks for a successor.
    pub search_interval_ms: u64,
    pub default_confirm_timeout_ms: u64,
    pub default_idle_threshold_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            search_interval_ms: 500,
            default_confirm_timeout_ms: 30_000,
            default_idle_threshold_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Byte budget for buffered payloads; 0 disables forced caps.
    pub capacity_bytes: u64,
    pub forced_limit_percent: u64,
    pub check_interval_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 0,
            forced_limit_percent: 90,
            check_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimerConfig {
    pub interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self { interval_ms: 1_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// Address peers use to reach this node.
    pub address: String,
    pub peers: Vec<String>,
    pub discovery_interval_ms: u64,
    pub stats_interval_ms: u64,
    pub stats_batch_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:7500".to_string(),
            peers: Vec::new(),
            discovery_interval_ms: 10_000,
            stats_interval_ms: 5_000,
            stats_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub queues: QueueConfig,
    pub memory: MemoryConfig,
    pub timer: TimerConfig,
    pub cluster: ClusterConfig,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file path and environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let effective_path = path
            .map(str::to_string)
            .or_else(|| env::var("RELAYMQ_CONFIG").ok());

        let mut config = match effective_path {
            Some(p) => toml::from_str(&fs::read_to_string(p)?)?,
            None => Config::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = env::var("RELAYMQ_ADMIN_USER") {
            self.server.admin_user = Some(v);
        }
        if let Ok(v) = env::var("RELAYMQ_ADMIN_PASSWORD") {
            self.server.admin_password = Some(v);
        }
        if let Ok(v) = env::var("RELAYMQ_MEMORY_CAPACITY") {
            self.memory.capacity_bytes = parse_env("RELAYMQ_MEMORY_CAPACITY", &v)?;
        }
        if let Ok(v) = env::var("RELAYMQ_FORCED_LIMIT_PERCENT") {
            self.memory.forced_limit_percent = parse_env("RELAYMQ_FORCED_LIMIT_PERCENT", &v)?;
        }
        if let Ok(v) = env::var("RELAYMQ_CLUSTER_ENABLED") {
            self.cluster.enabled =
                matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Ok(v) = env::var("RELAYMQ_CLUSTER_ADDRESS") {
            self.cluster.address = v;
        }
        if let Ok(v) = env::var("RELAYMQ_CLUSTER_PEERS") {
            self.cluster.peers = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.memory.forced_limit_percent) {
            return Err(ConfigError::Invalid(format!(
                "memory.forced_limit_percent must be within 1..=100, got {}",
                self.memory.forced_limit_percent
            )));
        }
        if self.cluster.stats_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "cluster.stats_batch_size must be positive".to_string(),
            ));
        }
        let zero_interval = [
            ("queues.poll_interval_ms", self.queues.poll_interval_ms),
            ("queues.search_interval_ms", self.queues.search_interval_ms),
            ("timer.interval_ms", self.timer.interval_ms),
            ("memory.check_interval_ms", self.memory.check_interval_ms),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);
        if let Some((name, _)) = zero_interval {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        if self.server.admin_user.is_some() != self.server.admin_password.is_some() {
            return Err(ConfigError::Invalid(
                "server.admin_user and server.admin_password must be set together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_settings(&self) -> BrokerSettings {
        let default_admin = match (&self.server.admin_user, &self.server.admin_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };
        BrokerSettings {
            default_admin,
            poll_interval: Duration::from_millis(self.queues.poll_interval_ms),
            search_interval: Duration::from_millis(self.queues.search_interval_ms),
            default_confirm_timeout: Duration::from_millis(self.queues.default_confirm_timeout_ms),
            default_idle_threshold: Duration::from_millis(self.queues.default_idle_threshold_ms),
            timer_interval: Duration::from_millis(self.timer.interval_ms),
            memory_capacity: self.memory.capacity_bytes,
            forced_limit_percent: self.memory.forced_limit_percent,
            memory_check_interval: Duration::from_millis(self.memory.check_interval_ms),
            cluster: self.cluster.enabled.then(|| ClusterSettings {
                address: self.cluster.address.clone(),
                peers: self.cluster.peers.clone(),
                discovery_interval: Duration::from_millis(self.cluster.discovery_interval_ms),
                stats_interval: Duration::from_millis(self.cluster.stats_interval_ms),
                stats_batch_size: self.cluster.stats_batch_size,
            }),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ConfigError::Parse(format!("{name}: {e}")))
}

/// Resolved settings consumed by the registry and its background tasks.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub default_admin: Option<(String, String)>,
    pub poll_interval: Duration,
    pub search_interval: Duration,
    pub default_confirm_timeout: Duration,
    pub default_idle_threshold: Duration,
    pub timer_interval: Duration,
    pub memory_capacity: u64,
    pub forced_limit_percent: u64,
    pub memory_check_interval: Duration,
    pub cluster: Option<ClusterSettings>,
}

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub address: String,
    pub peers: Vec<String>,
    pub discovery_interval: Duration,
    pub stats_interval: Duration,
    pub stats_batch_size: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Config::default().to_settings()
    }
}

impl BrokerSettings {
    pub fn with_cluster(mut self, address: impl Into<String>, peers: Vec<String>) -> Self {
        let defaults = Config::default().cluster;
        self.cluster = Some(ClusterSettings {
            address: address.into(),
            peers,
            discovery_interval: Duration::from_millis(defaults.discovery_interval_ms),
            stats_interval: Duration::from_millis(defaults.stats_interval_ms),
            stats_batch_size: defaults.stats_batch_size,
        });
        self
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let raw = fs::read_to_string(path)?;
    Config::from_toml_str(&raw)
}
