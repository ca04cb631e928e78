//! Configuration management for peernet.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/peernet/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::HttpConfig;
use crate::hub::{HubConfiguration, IceServer, RemoteHubConfig};
use crate::net::{NetConfig, DEFAULT_EPHEMERAL_PORT_START};

/// Relay URL used when none is configured.
pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:8787";

/// Address the relay server binds by default.
pub const DEFAULT_RELAY_BIND: &str = "127.0.0.1:8787";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("hub server_url must start with ws:// or wss://, got {0}")]
    InvalidHubUrl(String),

    #[error("ice server entry has no urls")]
    EmptyIceServer,

    #[error("initial_backoff_ms must be between 1 and max_backoff_ms ({max}), got {value}")]
    InvalidBackoff { value: u64, max: u64 },

    #[error("heartbeat_interval_secs must be greater than 0")]
    InvalidHeartbeat,

    #[error("connect_timeout_secs must be between 1 and 600, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("ephemeral_port_start must be at least 1024, got {0}")]
    InvalidEphemeralPortStart(u16),

    #[error("max_concurrent_connections must be between 1 and 10000, got {0}")]
    InvalidMaxConnections(usize),

    #[error("relay bind must be a socket address, got {0}")]
    InvalidRelayBind(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub hub: HubSection,
    pub net: NetSection,
    pub http: HttpSection,
    pub relay: RelaySection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Also write logs to this file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// Which hub implementation the CLI uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HubKind {
    /// In-process bus; only endpoints in the same process can talk.
    Local,
    /// WebSocket connection to a relay server.
    #[default]
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubSection {
    pub kind: HubKind,

    /// Base WebSocket URL of the relay.
    pub server_url: String,

    /// ICE servers handed to the WebRTC transport.
    pub ice_servers: Vec<IceServer>,

    pub auto_reconnect: bool,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetSection {
    pub connect_timeout_secs: u64,
    pub ephemeral_port_start: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpSection {
    pub max_concurrent_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelaySection {
    /// Socket address the relay listens on.
    pub bind: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        let remote = RemoteHubConfig::default();
        Self {
            kind: HubKind::default(),
            server_url: DEFAULT_HUB_URL.to_string(),
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
            ],
            auto_reconnect: remote.auto_reconnect,
            initial_backoff_ms: remote.initial_backoff.as_millis() as u64,
            max_backoff_ms: remote.max_backoff.as_millis() as u64,
            heartbeat_interval_secs: remote.heartbeat_interval.as_secs(),
        }
    }
}

impl Default for NetSection {
    fn default() -> Self {
        let net = NetConfig::default();
        Self {
            connect_timeout_secs: net.connect_timeout.as_secs(),
            ephemeral_port_start: DEFAULT_EPHEMERAL_PORT_START,
        }
    }
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            max_concurrent_connections: HttpConfig::default().max_concurrent_connections,
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_RELAY_BIND.to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peernet")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - PEERNET_HUB_URL: Override the relay URL
    /// - PEERNET_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PEERNET_HUB_URL") {
            if !url.is_empty() {
                tracing::info!(url = %url, "overriding hub server_url from environment");
                self.hub.server_url = url;
            }
        }

        if let Ok(level) = std::env::var("PEERNET_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!(level = %level, "overriding log level from environment");
                self.log.level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        let url = &self.hub.server_url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidHubUrl(url.clone()));
        }

        if self.hub.ice_servers.iter().any(|server| server.urls.is_empty()) {
            return Err(ConfigError::EmptyIceServer);
        }

        if self.hub.initial_backoff_ms == 0 || self.hub.initial_backoff_ms > self.hub.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff {
                value: self.hub.initial_backoff_ms,
                max: self.hub.max_backoff_ms,
            });
        }

        if self.hub.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidHeartbeat);
        }

        if !(1..=600).contains(&self.net.connect_timeout_secs) {
            return Err(ConfigError::InvalidConnectTimeout(self.net.connect_timeout_secs));
        }

        if self.net.ephemeral_port_start < 1024 {
            return Err(ConfigError::InvalidEphemeralPortStart(self.net.ephemeral_port_start));
        }

        if !(1..=10_000).contains(&self.http.max_concurrent_connections) {
            return Err(ConfigError::InvalidMaxConnections(
                self.http.max_concurrent_connections,
            ));
        }

        if self.relay.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidRelayBind(self.relay.bind.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    pub fn hub_configuration(&self) -> HubConfiguration {
        HubConfiguration {
            ice_servers: self.hub.ice_servers.clone(),
        }
    }

    pub fn remote_hub_config(&self) -> RemoteHubConfig {
        RemoteHubConfig {
            server_url: self.hub.server_url.clone(),
            initial_backoff: Duration::from_millis(self.hub.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.hub.max_backoff_ms),
            auto_reconnect: self.hub.auto_reconnect,
            heartbeat_interval: Duration::from_secs(self.hub.heartbeat_interval_secs),
            ..RemoteHubConfig::default()
        }
    }

    pub fn net_config(&self) -> NetConfig {
        NetConfig {
            connect_timeout: Duration::from_secs(self.net.connect_timeout_secs),
            ephemeral_port_start: self.net.ephemeral_port_start,
        }
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            max_concurrent_connections: self.http.max_concurrent_connections,
        }
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
