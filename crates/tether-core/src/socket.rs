//! Server-side connection pump.
//!
//! A [`Socket`] owns one accepted connection and runs three tasks for it: a
//! send loop draining the outbound queue, a receive loop reading the
//! transport, and an idle watchdog. Any read failure, an explicit stop, or a
//! missed heartbeat ends the socket for good; there is no reconnect on this
//! side. A failed write is reported through the hooks and does not end it.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_codec::{Codec, DEFAULT_MAX_DECOMPRESSED_SIZE};
use tether_transport::{Connection, MessageKind};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use crate::hooks::Hooks;

/// Payload a peer sends to keep its socket alive.
pub const DEFAULT_HEARTBEAT_PAYLOAD: &[u8] = b"ping";

/// Idle time after which a silent socket is stopped.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default outbound queue capacity.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 64;

/// Socket errors.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The socket has stopped.
    #[error("Socket stopped")]
    Stopped,

    /// The outbound queue is full.
    #[error("Send queue full")]
    QueueFull,

    /// `run` was called twice.
    #[error("Socket already running")]
    AlreadyRunning,

    /// Invalid configuration.
    #[error("Invalid socket config: {0}")]
    InvalidConfig(&'static str),
}

/// Socket configuration.
#[derive(Clone)]
pub struct SocketConfig {
    /// Outbound queue capacity.
    pub send_queue_capacity: usize,
    /// Payload that resets the idle timer.
    pub heartbeat_payload: Bytes,
    /// Maximum time between two heartbeats.
    pub heartbeat_interval: Duration,
    /// Codec applied to outbound payloads.
    pub send_codec: Option<Arc<dyn Codec>>,
    /// Codec applied to inbound payloads.
    pub recv_codec: Option<Arc<dyn Codec>>,
    /// Largest inbound payload after decompression.
    pub max_decompressed_size: usize,
    /// User callbacks.
    pub hooks: Hooks,
    /// Parent span for the socket's own span.
    pub span: Span,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            heartbeat_payload: Bytes::from_static(DEFAULT_HEARTBEAT_PAYLOAD),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            send_codec: None,
            recv_codec: None,
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
            hooks: Hooks::default(),
            span: Span::none(),
        }
    }
}

impl SocketConfig {
    /// Use the same codec in both directions.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.send_codec = Some(codec.clone());
        self.recv_codec = Some(codec);
        self
    }

    /// Set the heartbeat payload and interval.
    #[must_use]
    pub fn with_heartbeat(mut self, payload: impl Into<Bytes>, interval: Duration) -> Self {
        self.heartbeat_payload = payload.into();
        self.heartbeat_interval = interval;
        self
    }

    /// Set the user callbacks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero queue capacity or heartbeat interval.
    pub fn validate(&self) -> Result<(), SocketError> {
        if self.send_queue_capacity == 0 {
            return Err(SocketError::InvalidConfig("send queue capacity must be > 0"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(SocketError::InvalidConfig("heartbeat interval must be > 0"));
        }
        if self.max_decompressed_size == 0 {
            return Err(SocketError::InvalidConfig("max decompressed size must be > 0"));
        }
        Ok(())
    }
}

impl fmt::Debug for SocketConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketConfig")
            .field("send_queue_capacity", &self.send_queue_capacity)
            .field("heartbeat_payload", &self.heartbeat_payload)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("send_codec", &self.send_codec.as_ref().map(|c| c.name()))
            .field("recv_codec", &self.recv_codec.as_ref().map(|c| c.name()))
            .field("max_decompressed_size", &self.max_decompressed_size)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Identity of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketInfo {
    /// Server-assigned identifier.
    pub id: String,
    /// Peer address.
    pub remote_addr: String,
}

/// A server-side connection.
///
/// Cloning yields another handle to the same socket.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    id: String,
    remote_addr: String,
    conn: Arc<dyn Connection>,
    config: SocketConfig,
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    heartbeat: Notify,
    running: AtomicBool,
    cancel: CancellationToken,
    span: Span,
}

impl Socket {
    /// Create a socket over an accepted connection.
    ///
    /// The socket's lifetime is a child of `parent` when given: cancelling the
    /// parent stops the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        id: impl Into<String>,
        conn: Arc<dyn Connection>,
        config: SocketConfig,
        parent: Option<&CancellationToken>,
    ) -> Result<Self, SocketError> {
        config.validate()?;

        let id = id.into();
        let remote_addr = conn.remote_addr().unwrap_or_else(|| "unknown".to_string());
        let (tx, rx) = mpsc::channel(config.send_queue_capacity);
        let cancel = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let span = info_span!(parent: &config.span, "socket", socket = %id, from = %remote_addr);

        Ok(Self {
            inner: Arc::new(SocketInner {
                id,
                remote_addr,
                conn,
                config,
                tx,
                rx: Mutex::new(Some(rx)),
                heartbeat: Notify::new(),
                running: AtomicBool::new(false),
                cancel,
                span,
            }),
        })
    }

    /// Server-assigned identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Peer address.
    #[must_use]
    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    /// Identity snapshot.
    #[must_use]
    pub fn info(&self) -> SocketInfo {
        SocketInfo {
            id: self.inner.id.clone(),
            remote_addr: self.inner.remote_addr.clone(),
        }
    }

    /// Start the send loop, the receive loop and the idle watchdog.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::AlreadyRunning`] on a second call.
    pub fn run(&self) -> Result<(), SocketError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(SocketError::AlreadyRunning);
        }
        let rx = self
            .inner
            .rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(SocketError::AlreadyRunning)?;

        let span = self.inner.span.clone();
        debug!(parent: &span, "Socket running");

        tokio::spawn(self.inner.clone().send_loop(rx).instrument(span.clone()));
        tokio::spawn(self.inner.clone().recv_loop().instrument(span.clone()));
        tokio::spawn(self.inner.clone().watchdog().instrument(span.clone()));
        tokio::spawn(self.inner.clone().close_on_stop().instrument(span));

        Ok(())
    }

    /// Queue a payload for delivery.
    ///
    /// Waits only while the outbound queue is full; never waits for the write.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Stopped`] once the socket has stopped.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), SocketError> {
        self.inner.enqueue(payload.into()).await
    }

    /// Queue a payload without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::QueueFull`] if the queue is full, or
    /// [`SocketError::Stopped`] once the socket has stopped.
    pub fn try_send(&self, payload: impl Into<Bytes>) -> Result<(), SocketError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SocketError::Stopped);
        }
        self.inner.tx.try_send(payload.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SocketError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SocketError::Stopped,
        })
    }

    /// Stop the socket. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Wait until the socket has stopped.
    pub async fn stopped(&self) {
        self.inner.cancel.cancelled().await;
    }

    /// Whether the socket has stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Whether two handles refer to the same socket.
    #[must_use]
    pub fn ptr_eq(&self, other: &Socket) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl SocketInner {
    fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!(parent: &self.span, "Socket stopping");
            self.cancel.cancel();
        }
    }

    async fn enqueue(&self, payload: Bytes) -> Result<(), SocketError> {
        if self.cancel.is_cancelled() {
            return Err(SocketError::Stopped);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SocketError::Stopped),
            sent = self.tx.send(payload) => sent.map_err(|_| SocketError::Stopped),
        }
    }

    async fn send_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Bytes>) {
        loop {
            let payload = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                payload = rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };
            self.write(payload).await;
        }
        trace!("Send loop exited");
    }

    async fn write(&self, payload: Bytes) {
        let hooks = &self.config.hooks;
        hooks.sending(&payload);

        let wire = match &self.config.send_codec {
            Some(codec) => match codec.compress(&payload) {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, codec = codec.name(), "Dropping payload that failed to compress");
                    return;
                }
            },
            None => payload,
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            result = self.conn.write_message(MessageKind::Binary, wire.clone()) => result,
        };

        match result {
            Ok(()) => hooks.sent(&wire),
            Err(e) => {
                warn!(error = %e, "Send failed");
                hooks.send_failed(&e);
            }
        }
    }

    async fn recv_loop(self: Arc<Self>) {
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.conn.read_message() => result,
            };

            match result {
                Ok(Some(data)) => self.handle_inbound(data).await,
                Ok(None) => {
                    debug!("Peer closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Receive failed");
                    self.config.hooks.receive_failed(&e);
                    break;
                }
            }
        }
        self.stop();
        trace!("Receive loop exited");
    }

    async fn handle_inbound(&self, data: Bytes) {
        let data = match &self.config.recv_codec {
            Some(codec) => match codec.decompress_limited(&data, self.config.max_decompressed_size) {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, codec = codec.name(), "Dropping payload that failed to decompress");
                    return;
                }
            },
            None => data,
        };

        if data == self.config.heartbeat_payload {
            trace!("Heartbeat");
            self.heartbeat.notify_one();
        }

        if let Some(reply) = self.config.hooks.received(data) {
            if let Err(e) = self.enqueue(reply).await {
                debug!(error = %e, "Reply dropped");
            }
        }
    }

    async fn watchdog(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = self.heartbeat.notified() => continue,
                _ = tokio::time::sleep(interval) => {
                    info!(interval_ms = interval.as_millis() as u64, "Heartbeat timed out");
                    self.stop();
                    return;
                }
            }
        }
    }

    async fn close_on_stop(self: Arc<Self>) {
        self.cancel.cancelled().await;
        if let Err(e) = self.conn.close().await {
            debug!(error = %e, "Close failed");
        }
        info!("Socket closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tether_codec::Compressor;
    use tether_transport::memory::{self, MemoryConnection};

    fn socket_over_pair(config: SocketConfig) -> (Socket, MemoryConnection, MemoryConnection) {
        let (client, server) = memory::pair(16);
        let socket = Socket::new("sock-1", Arc::new(server.clone()), config, None).unwrap();
        socket.run().unwrap();
        (socket, client, server)
    }

    async fn write(conn: &MemoryConnection, data: &'static [u8]) {
        conn.write_message(MessageKind::Binary, Bytes::from_static(data))
            .await
            .unwrap();
    }

    #[test]
    fn test_config_validation() {
        let config = SocketConfig {
            send_queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SocketError::InvalidConfig(_))));

        let config = SocketConfig::default().with_heartbeat("hb", Duration::ZERO);
        assert!(config.validate().is_err());
        assert!(SocketConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_send_reaches_peer_in_order() {
        let (socket, client, _server) = socket_over_pair(SocketConfig::default());
        assert_eq!(socket.info().remote_addr, "memory:client");

        for i in 0..20u8 {
            socket.send(vec![i]).await.unwrap();
        }
        for i in 0..20u8 {
            let data = client.read_message().await.unwrap().unwrap();
            assert_eq!(&data[..], &[i]);
        }
        socket.stop();
    }

    #[tokio::test]
    async fn test_receive_handler_reply() {
        let config = SocketConfig::default().with_hooks(Hooks::new().on_receive(|data| {
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(&data);
            Some(Bytes::from(reply))
        }));
        let (socket, client, _server) = socket_over_pair(config);

        write(&client, b"hello").await;
        assert_eq!(client.read_message().await.unwrap().unwrap(), "echo:hello");
        assert!(!socket.is_stopped());
    }

    #[tokio::test]
    async fn test_peer_close_stops_socket() {
        let (socket, client, _server) = socket_over_pair(SocketConfig::default());
        client.close().await.unwrap();

        socket.stopped().await;
        assert!(matches!(socket.send("late").await, Err(SocketError::Stopped)));
        assert!(matches!(socket.try_send("late"), Err(SocketError::Stopped)));
    }

    #[tokio::test]
    async fn test_stop_closes_connection() {
        let (socket, client, server) = socket_over_pair(SocketConfig::default());
        socket.stop();
        socket.stop();

        assert!(client.read_message().await.unwrap().is_none());
        assert!(!server.is_open());
        assert!(matches!(socket.run(), Err(SocketError::AlreadyRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_heartbeat_stops_socket() {
        let config = SocketConfig::default().with_heartbeat("hb", Duration::from_millis(100));
        let (socket, client, _server) = socket_over_pair(config);

        // Traffic that is not the heartbeat payload does not count.
        write(&client, b"hello").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        write(&client, b"hello").await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(socket.is_stopped());
        assert!(client.read_message().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_socket_alive() {
        let config = SocketConfig::default().with_heartbeat("hb", Duration::from_millis(100));
        let (socket, client, _server) = socket_over_pair(config);

        for _ in 0..50 {
            write(&client, b"hb").await;
            tokio::time::sleep(Duration::from_millis(80)).await;
            assert!(!socket.is_stopped());
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(socket.is_stopped());
    }

    #[tokio::test]
    async fn test_compressed_roundtrip_and_bad_payload() {
        let codec: Arc<dyn Codec> = Arc::new(Compressor::gzip(5));
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let config = SocketConfig::default()
            .with_codec(codec.clone())
            .with_hooks(Hooks::new().on_receive(move |data| {
                sink.lock().unwrap().push(data);
                Some(Bytes::from_static(b"ack"))
            }));
        let (socket, client, _server) = socket_over_pair(config);

        // Not gzip: dropped, socket keeps running.
        write(&client, b"plain text").await;
        let packed = codec.compress(b"compressed hello").unwrap();
        client.write_message(MessageKind::Binary, packed).await.unwrap();

        let wire = client.read_message().await.unwrap().unwrap();
        assert_ne!(wire, "ack");
        assert_eq!(codec.decompress(&wire).unwrap(), "ack");

        let received = received.lock().unwrap().clone();
        assert_eq!(received, vec![Bytes::from_static(b"compressed hello")]);
        assert!(!socket.is_stopped());
    }

    #[tokio::test]
    async fn test_oversized_inflated_payload_dropped() {
        let codec: Arc<dyn Codec> = Arc::new(Compressor::zlib(9));
        let mut config = SocketConfig::default()
            .with_codec(codec.clone())
            .with_hooks(Hooks::new().on_receive(|data| Some(Bytes::from(data.len().to_string()))));
        config.max_decompressed_size = 1024;
        let (socket, client, _server) = socket_over_pair(config);

        let big = codec.compress(&[7u8; 4096]).unwrap();
        client.write_message(MessageKind::Binary, big).await.unwrap();
        let small = codec.compress(&[7u8; 1024]).unwrap();
        client.write_message(MessageKind::Binary, small).await.unwrap();

        let wire = client.read_message().await.unwrap().unwrap();
        assert_eq!(codec.decompress(&wire).unwrap(), "1024");
        assert!(!socket.is_stopped());
    }

    #[tokio::test]
    async fn test_write_failure_reported_not_fatal() {
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        let config = SocketConfig::default().with_hooks(Hooks::new().on_send_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // The socket writes through a handle whose peer is already gone, while
        // reads come from a live pair.
        let (client, server) = memory::pair(4);
        let socket = Socket::new("s", Arc::new(FailingWrites(server)), config, None).unwrap();
        socket.run().unwrap();

        socket.send("a").await.unwrap();
        socket.send("b").await.unwrap();
        while failures.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert!(!socket.is_stopped());
        drop(client);
    }

    struct FailingWrites(MemoryConnection);

    #[async_trait::async_trait]
    impl Connection for FailingWrites {
        async fn read_message(&self) -> Result<Option<Bytes>, tether_transport::TransportError> {
            self.0.read_message().await
        }

        async fn write_message(
            &self,
            _kind: MessageKind,
            _data: Bytes,
        ) -> Result<(), tether_transport::TransportError> {
            Err(tether_transport::TransportError::SendFailed("broken pipe".into()))
        }

        async fn close(&self) -> Result<(), tether_transport::TransportError> {
            self.0.close().await
        }

        fn is_open(&self) -> bool {
            self.0.is_open()
        }
    }
}
