//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (TETHER_HOST, TETHER_PORT)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tether_codec::{Codec, Compressor};
use tether_core::{Hooks, RoomConfig, SocketConfig};
use thiserror::Error;

use crate::server::ServerOptions;

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Host and port do not form a socket address.
    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    /// A value is out of range.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Queue and message limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat expected from clients.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Payload compression.
    #[serde(default)]
    pub compression: Compressor,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Rooms to serve.
    #[serde(default = "default_rooms")]
    pub rooms: Vec<RoomEntry>,
}

/// Queue and message limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum inbound payload size after decompression.
    #[serde(default = "default_max_decompressed_size")]
    pub max_decompressed_size: usize,

    /// Per-socket outbound queue capacity.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Per-room broadcast queue capacity.
    #[serde(default = "default_broadcast_queue_capacity")]
    pub broadcast_queue_capacity: usize,

    /// Concurrent sends for members with a full queue.
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Payload that keeps a socket alive.
    #[serde(default = "default_heartbeat_payload")]
    pub payload: String,

    /// Idle time in milliseconds after which a socket is stopped.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// A room bound to a request path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEntry {
    /// Exact request path.
    pub path: String,

    /// Reply to every inbound payload with the same payload.
    #[serde(default)]
    pub echo: bool,
}

// Default value functions
fn default_host() -> String {
    std::env::var("TETHER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("TETHER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9000)
}

fn default_true() -> bool {
    true
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_max_decompressed_size() -> usize {
    tether_codec::DEFAULT_MAX_DECOMPRESSED_SIZE
}

fn default_send_queue_capacity() -> usize {
    tether_core::DEFAULT_SEND_QUEUE_CAPACITY
}

fn default_broadcast_queue_capacity() -> usize {
    tether_core::DEFAULT_BROADCAST_CAPACITY
}

fn default_dispatch_concurrency() -> usize {
    tether_core::DEFAULT_DISPATCH_CONCURRENCY
}

fn default_heartbeat_payload() -> String {
    "ping".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_rooms() -> Vec<RoomEntry> {
    vec![RoomEntry {
        path: "/ws".to_string(),
        echo: false,
    }]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            compression: Compressor::default(),
            metrics: MetricsConfig::default(),
            rooms: default_rooms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_decompressed_size: default_max_decompressed_size(),
            send_queue_capacity: default_send_queue_capacity(),
            broadcast_queue_capacity: default_broadcast_queue_capacity(),
            dispatch_concurrency: default_dispatch_concurrency(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            payload: default_heartbeat_payload(),
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "tether.toml",
            "/etc/tether/tether.toml",
            "~/.config/tether/tether.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("limits.max_message_size", self.limits.max_message_size),
            ("limits.max_decompressed_size", self.limits.max_decompressed_size),
            ("limits.send_queue_capacity", self.limits.send_queue_capacity),
            ("limits.broadcast_queue_capacity", self.limits.broadcast_queue_capacity),
            ("limits.dispatch_concurrency", self.limits.dispatch_concurrency),
        ];
        if let Some((field, _)) = positive.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidValue {
                field,
                reason: "must be > 0",
            });
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat.interval_ms",
                reason: "must be > 0",
            });
        }
        if self.heartbeat.payload.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat.payload",
                reason: "must not be empty",
            });
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not parse as an address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidAddress(addr))
    }

    /// Server options for this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address is invalid.
    pub fn server_options(&self) -> Result<ServerOptions, ConfigError> {
        Ok(ServerOptions {
            addr: self.bind_addr()?,
            max_message_size: self.limits.max_message_size,
            ..ServerOptions::default()
        })
    }

    /// Room configuration for `entry`.
    #[must_use]
    pub fn room_config(&self, entry: &RoomEntry) -> RoomConfig {
        let mut socket = SocketConfig {
            send_queue_capacity: self.limits.send_queue_capacity,
            max_decompressed_size: self.limits.max_decompressed_size,
            ..SocketConfig::default()
        }
        .with_heartbeat(
            self.heartbeat.payload.clone(),
            Duration::from_millis(self.heartbeat.interval_ms),
        );

        if !self.compression.is_none() {
            let codec: Arc<dyn Codec> = Arc::new(self.compression);
            socket = socket.with_codec(codec);
        }
        if entry.echo {
            socket = socket.with_hooks(Hooks::new().on_receive(Some));
        }

        RoomConfig {
            broadcast_capacity: self.limits.broadcast_queue_capacity,
            dispatch_concurrency: self.limits.dispatch_concurrency,
            socket,
            ..RoomConfig::default()
        }
    }
}
