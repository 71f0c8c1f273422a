//! Pump configuration.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_codec::{Codec, DEFAULT_MAX_DECOMPRESSED_SIZE};
use tether_core::Hooks;
use tracing::Span;

use crate::ClientError;

/// Fixed delay before a redial.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

/// Default dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default outbound queue capacity.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 64;

/// Shortest accepted keep-alive interval.
pub const MIN_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Payload sent periodically while connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlive {
    /// Payload to send.
    pub payload: Bytes,
    /// Interval between two sends, at least [`MIN_KEEP_ALIVE_INTERVAL`].
    pub interval: Duration,
}

/// Configuration of a [`ConnectionPump`](crate::ConnectionPump).
#[derive(Clone)]
pub struct PumpConfig {
    /// Endpoint to dial.
    pub address: String,
    /// Extra headers sent with every dial.
    pub headers: Vec<(String, String)>,
    /// Redial after a disconnect instead of stopping.
    pub reconnect: bool,
    /// Delay before each redial.
    pub reconnect_backoff: Duration,
    /// Upper bound on a single dial.
    pub dial_timeout: Duration,
    /// Outbound queue capacity.
    pub send_queue_capacity: usize,
    /// Optional keep-alive payload.
    pub keep_alive: Option<KeepAlive>,
    /// Codec applied to outbound payloads.
    pub send_codec: Option<Arc<dyn Codec>>,
    /// Codec applied to inbound payloads.
    pub recv_codec: Option<Arc<dyn Codec>>,
    /// Largest inbound payload after decompression.
    pub max_decompressed_size: usize,
    /// User callbacks, run after the built-in ones.
    pub hooks: Hooks,
    /// Parent span for the pump's own span.
    pub span: Span,
}

impl PumpConfig {
    /// Create a configuration for `address` with defaults.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            headers: Vec::new(),
            reconnect: true,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            keep_alive: None,
            send_codec: None,
            recv_codec: None,
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
            hooks: Hooks::default(),
            span: Span::none(),
        }
    }

    /// Add a dial header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Enable or disable reconnection.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Send `payload` every `interval` while connected.
    ///
    /// Intervals below [`MIN_KEEP_ALIVE_INTERVAL`] are raised to it.
    #[must_use]
    pub fn with_keep_alive(mut self, payload: impl Into<Bytes>, interval: Duration) -> Self {
        self.keep_alive = Some(KeepAlive {
            payload: payload.into(),
            interval: interval.max(MIN_KEEP_ALIVE_INTERVAL),
        });
        self
    }

    /// Use the same codec in both directions.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.send_codec = Some(codec.clone());
        self.recv_codec = Some(codec);
        self
    }

    /// Set the user callbacks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Set the parent span.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] for an empty address or any
    /// zero limit.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.address.is_empty() {
            return Err(ClientError::InvalidConfig("address must not be empty"));
        }
        if self.send_queue_capacity == 0 {
            return Err(ClientError::InvalidConfig("send queue capacity must be > 0"));
        }
        if self.dial_timeout.is_zero() {
            return Err(ClientError::InvalidConfig("dial timeout must be > 0"));
        }
        if self.max_decompressed_size == 0 {
            return Err(ClientError::InvalidConfig("max decompressed size must be > 0"));
        }
        Ok(())
    }

    /// Keep-alive with the interval floor applied, whichever way it was set.
    pub(crate) fn effective_keep_alive(&self) -> Option<KeepAlive> {
        self.keep_alive.as_ref().map(|k| KeepAlive {
            payload: k.payload.clone(),
            interval: k.interval.max(MIN_KEEP_ALIVE_INTERVAL),
        })
    }
}

impl fmt::Debug for PumpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PumpConfig")
            .field("address", &self.address)
            .field("headers", &self.headers)
            .field("reconnect", &self.reconnect)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .field("dial_timeout", &self.dial_timeout)
            .field("send_queue_capacity", &self.send_queue_capacity)
            .field("keep_alive", &self.keep_alive)
            .field("send_codec", &self.send_codec.as_ref().map(|c| c.name()))
            .field("recv_codec", &self.recv_codec.as_ref().map(|c| c.name()))
            .field("max_decompressed_size", &self.max_decompressed_size)
            .field("hooks", &self.hooks)
            .finish()
    }
}
