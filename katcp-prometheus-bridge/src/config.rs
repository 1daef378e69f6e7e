//! Configuration for the KATCP Prometheus bridge.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use katcp_common::LoggingConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("KATCP {0} is required (set KATCP_{1} or --katcp-{0})")]
    Missing(&'static str, &'static str),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// KATCP device connection settings.
    #[serde(default)]
    pub katcp: KatcpConfig,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Sensor filtering settings.
    #[serde(default)]
    pub filters: FilterConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// KATCP device connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KatcpConfig {
    /// Device host name or address. Required, usually supplied via `KATCP_HOST`.
    #[serde(default)]
    pub host: Option<String>,

    /// Device port. Required, usually supplied via `KATCP_PORT`.
    #[serde(default)]
    pub port: Option<u16>,

    /// Expose `string` and `address` sensors as indices into the list of
    /// values seen so far.
    #[serde(default)]
    pub workaround_strings: bool,

    /// TCP connect timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Time allowed for the initial sensor listing (seconds).
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,

    /// Delay before reconnecting after the connection drops (seconds).
    /// Zero disables reconnection.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_sync_timeout() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    5
}

impl Default for KatcpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            workaround_strings: false,
            connect_timeout_secs: default_connect_timeout(),
            sync_timeout_secs: default_sync_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl KatcpConfig {
    /// The `host:port` address of the device.
    pub fn address(&self) -> Result<String, ConfigError> {
        let host = self
            .host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or(ConfigError::Missing("host", "HOST"))?;
        let port = self
            .port
            .filter(|p| *p != 0)
            .ok_or(ConfigError::Missing("port", "PORT"))?;
        Ok(format!("{}:{}", host, port))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    /// Reconnect delay, or `None` when reconnection is disabled.
    pub fn reconnect_delay(&self) -> Option<Duration> {
        (self.reconnect_delay_secs > 0).then(|| Duration::from_secs(self.reconnect_delay_secs))
    }
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Metric name prefix (default: none).
    #[serde(default)]
    pub prefix: String,

    /// Append a `katcp_sync_state` gauge describing the device connection.
    #[serde(default = "default_expose_sync_state")]
    pub expose_sync_state: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_expose_sync_state() -> bool {
    true
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            prefix: String::new(),
            expose_sync_state: default_expose_sync_state(),
        }
    }
}

impl PrometheusConfig {
    /// Replace the port of the listen address, keeping its host part.
    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        let mut addr: SocketAddr = self.listen.parse().map_err(|_| {
            ConfigError::Validation(format!("Invalid listen address: {}", self.listen))
        })?;
        addr.set_port(port);
        self.listen = addr.to_string();
        Ok(())
    }
}

/// Sensor filtering configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Glob patterns for sensor names to include (empty = all).
    #[serde(default)]
    pub include_sensors: Vec<String>,

    /// Glob patterns for sensor names to exclude.
    #[serde(default)]
    pub exclude_sensors: Vec<String>,
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    ///
    /// The device endpoint may still be missing; see [`BridgeConfig::validate`].
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = json5::from_str(content)?;
        config.validate_settings()?;
        Ok(config)
    }

    /// Validate everything except the presence of the device endpoint.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        if self.katcp.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "connect_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.katcp.sync_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "sync_timeout_secs must be > 0".to_string(),
            ));
        }

        if self
            .prometheus
            .listen
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            )));
        }

        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        for pattern in self
            .filters
            .include_sensors
            .iter()
            .chain(&self.filters.exclude_sensors)
        {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(ConfigError::Validation(format!(
                    "Invalid sensor pattern '{}': {}",
                    pattern, e
                )));
            }
        }

        Ok(())
    }

    /// Full validation, run once all overrides have been applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_settings()?;
        self.katcp.address()?;
        Ok(())
    }
}
