//! User callbacks shared by client pumps and server sockets.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tether_transport::TransportError;

/// Called with every inbound (decompressed) payload; a returned payload is
/// queued back on the same connection.
pub type ReceiveHandler = Arc<dyn Fn(Bytes) -> Option<Bytes> + Send + Sync>;

/// Called with a payload around a transport write.
pub type PayloadHook = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Called with a transport failure.
pub type ErrorHook = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Called after a connection is established.
pub type ConnectHook = Arc<dyn Fn() + Send + Sync>;

/// Callback set attached to a connection.
///
/// `before_send` sees the plaintext payload; `after_send` sees the bytes that
/// were actually written, i.e. after compression.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Run after every successful dial (client only).
    pub on_connect: Vec<ConnectHook>,
    /// Inbound payload handler.
    pub on_receive: Option<ReceiveHandler>,
    /// Run before a payload is compressed and written.
    pub before_send: Option<PayloadHook>,
    /// Run after a payload was written.
    pub after_send: Option<PayloadHook>,
    /// Run when a read fails.
    pub on_receive_error: Vec<ErrorHook>,
    /// Run when a write fails.
    pub on_send_error: Vec<ErrorHook>,
}

impl Hooks {
    /// Create an empty callback set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an on-connect callback.
    #[must_use]
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect.push(Arc::new(f));
        self
    }

    /// Set the inbound payload handler.
    #[must_use]
    pub fn on_receive(mut self, f: impl Fn(Bytes) -> Option<Bytes> + Send + Sync + 'static) -> Self {
        self.on_receive = Some(Arc::new(f));
        self
    }

    /// Set the pre-send callback.
    #[must_use]
    pub fn before_send(mut self, f: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.before_send = Some(Arc::new(f));
        self
    }

    /// Set the post-send callback.
    #[must_use]
    pub fn after_send(mut self, f: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.after_send = Some(Arc::new(f));
        self
    }

    /// Add a receive-error callback.
    #[must_use]
    pub fn on_receive_error(mut self, f: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.on_receive_error.push(Arc::new(f));
        self
    }

    /// Add a send-error callback.
    #[must_use]
    pub fn on_send_error(mut self, f: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.on_send_error.push(Arc::new(f));
        self
    }

    /// Dispatch an inbound payload to the handler.
    pub fn received(&self, data: Bytes) -> Option<Bytes> {
        self.on_receive.as_ref().and_then(|f| f(data))
    }

    /// Run the pre-send callback on a plaintext payload.
    pub fn sending(&self, data: &[u8]) {
        if let Some(f) = &self.before_send {
            f(data);
        }
    }

    /// Run the post-send callback on the bytes that were written.
    pub fn sent(&self, data: &[u8]) {
        if let Some(f) = &self.after_send {
            f(data);
        }
    }

    /// Run every receive-error callback.
    pub fn receive_failed(&self, err: &TransportError) {
        for f in &self.on_receive_error {
            f(err);
        }
    }

    /// Run every send-error callback.
    pub fn send_failed(&self, err: &TransportError) {
        for f in &self.on_send_error {
            f(err);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_connect", &self.on_connect.len())
            .field("on_receive", &self.on_receive.is_some())
            .field("before_send", &self.before_send.is_some())
            .field("after_send", &self.after_send.is_some())
            .field("on_receive_error", &self.on_receive_error.len())
            .field("on_send_error", &self.on_send_error.len())
            .finish()
    }
}
