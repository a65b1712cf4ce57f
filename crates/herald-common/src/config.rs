//! ---
//! herald_section: "01-core-functionality"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Shared primitives and utilities for the ambassador runtime."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_channel() -> String {
    "log_channel".to_owned()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> Duration {
    Duration::from_millis(60_000)
}

fn default_max_retries() -> u32 {
    3
}

fn default_connect_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_broker_host() -> String {
    "localhost".to_owned()
}

fn default_broker_port() -> u16 {
    6379
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(2_000)
}

fn default_command_timeout() -> Duration {
    Duration::from_millis(2_000)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

fn default_metrics_log_interval() -> Duration {
    Duration::from_secs(30)
}

/// Primary configuration object for the Herald daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub ambassador: AmbassadorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where a [`HeraldConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedHeraldConfig {
    pub config: HeraldConfig,
    pub source: PathBuf,
}

impl HeraldConfig {
    pub const ENV_CONFIG_PATH: &'static str = "HERALD_CONFIG";

    /// Load configuration from disk, respecting the `HERALD_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedHeraldConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedHeraldConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedHeraldConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Read and validate a configuration file at a known location.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<HeraldConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.ambassador.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for HeraldConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: HeraldConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Options recognised by the publishing ambassador.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbassadorConfig {
    /// Default target channel used when a publish names none.
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before it closes on its own.
    #[serde(default = "default_reset_timeout", rename = "reset_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reset_timeout: Duration,
    /// Bounds reconnect attempts made by the broker connection, not queue retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Maximum wait for a fresh connection during a publish call.
    #[serde(default = "default_connect_grace", rename = "connect_grace_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_grace: Duration,
    /// Maximum number of undelivered messages kept for retry.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// What happens to a message arriving at a full queue.
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default)]
    pub broker: BrokerConfig,
}

impl Default for AmbassadorConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            failure_threshold: default_failure_threshold(),
            reset_timeout: default_reset_timeout(),
            max_retries: default_max_retries(),
            connect_grace: default_connect_grace(),
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl AmbassadorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(anyhow!("ambassador channel cannot be empty"));
        }
        if self.failure_threshold == 0 {
            return Err(anyhow!("failure_threshold must be at least 1"));
        }
        if self.reset_timeout.is_zero() {
            return Err(anyhow!("reset_timeout_ms must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be at least 1"));
        }
        self.broker.validate()
    }
}

/// Behaviour of the failed-message queue once it reaches capacity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to admit the new one.
    #[default]
    DropOldest,
    /// Refuse the new message and keep the queue untouched.
    DropNewest,
}

/// Broker implementations the daemon knows how to connect to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Redis,
    Memory,
}

impl BrokerKind {
    /// Name matching the connector that serves this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerKind::Redis => "redis",
            BrokerKind::Memory => "memory",
        }
    }
}

impl std::str::FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(BrokerKind::Redis),
            "memory" => Ok(BrokerKind::Memory),
            other => Err(format!("unknown broker kind: {}", other)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout", rename = "connect_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    /// Upper bound on a single publish round-trip.
    #[serde(default = "default_command_timeout", rename = "command_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub command_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            host: default_broker_host(),
            port: default_broker_port(),
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("broker host cannot be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("broker port must be non-zero"));
        }
        if self.connect_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(anyhow!("broker timeouts must be greater than zero"));
        }
        Ok(())
    }

    /// `host:port` form used for logging and socket connects.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_metrics_log_interval", rename = "log_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub log_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
            log_interval: default_metrics_log_interval(),
        }
    }
}
