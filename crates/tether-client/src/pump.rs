//! Reconnecting client connection pump.
//!
//! A [`ConnectionPump`] keeps one logical connection to an endpoint alive. It
//! runs four tasks:
//!
//! - **monitor** - dials, waits for a disconnect, backs off, redials
//! - **receive** - reads the current connection and dispatches payloads
//! - **send** - drains the outbound queue in order onto the current connection
//! - **ping** - sends the keep-alive payload while connected (optional)
//!
//! The outbound queue survives disconnects: payloads written while
//! disconnected go out after the next successful dial.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tether_codec::CodecError;
use tether_core::IdGenerator;
use tether_transport::{Dialer, MessageKind, TransportError, CLIENT_ID_HEADER};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use crate::config::{KeepAlive, PumpConfig};
use crate::envelope::Envelope;
use crate::state::{ConnectivityState, Link};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The pump has stopped.
    #[error("Pump stopped")]
    Stopped,

    /// The outbound queue is full.
    #[error("Send queue full")]
    QueueFull,

    /// `run` was called twice.
    #[error("Pump already running")]
    AlreadyRunning,

    /// Invalid configuration.
    #[error("Invalid pump config: {0}")]
    InvalidConfig(&'static str),

    /// The payload could not be compressed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The transport write failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A reconnecting client connection.
///
/// Cloning yields another handle to the same pump.
#[derive(Clone)]
pub struct ConnectionPump {
    inner: Arc<PumpInner>,
}

struct PumpInner {
    id: String,
    config: PumpConfig,
    headers: Vec<(String, String)>,
    dialer: Arc<dyn Dialer>,
    link: Link,
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    running: AtomicBool,
    cancel: CancellationToken,
    span: Span,
}

impl ConnectionPump {
    /// Create a pump dialing through `dialer`.
    ///
    /// The pump's lifetime is a child of `parent` when given.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] if the configuration is invalid.
    pub fn new(
        config: PumpConfig,
        dialer: Arc<dyn Dialer>,
        parent: Option<&CancellationToken>,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let id = IdGenerator::default().next_id();
        let mut headers = config.headers.clone();
        headers.push((CLIENT_ID_HEADER.to_string(), id.clone()));

        let (tx, rx) = mpsc::channel(config.send_queue_capacity);
        let cancel = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let span = info_span!(parent: &config.span, "client", client = %id, addr = %config.address);

        Ok(Self {
            inner: Arc::new(PumpInner {
                id,
                config,
                headers,
                dialer,
                link: Link::new(),
                tx,
                rx: Mutex::new(Some(rx)),
                running: AtomicBool::new(false),
                cancel,
                span,
            }),
        })
    }

    /// Create a pump dialing WebSocket endpoints with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] if the configuration is invalid.
    #[cfg(feature = "websocket")]
    pub fn websocket(config: PumpConfig) -> Result<Self, ClientError> {
        Self::new(
            config,
            Arc::new(tether_transport::WebSocketDialer::default()),
            None,
        )
    }

    /// Client identifier sent with every dial.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current connectivity state.
    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        self.inner.link.state()
    }

    /// Watch connectivity transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.link.subscribe()
    }

    /// Wait until the pump is connected.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Stopped`] if the pump stops first.
    pub async fn connected(&self) -> Result<(), ClientError> {
        self.inner
            .link
            .connected(&self.inner.cancel)
            .await
            .map(|_| ())
            .ok_or(ClientError::Stopped)
    }

    /// Start the monitor, receive, send and (if configured) ping tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AlreadyRunning`] on a second call.
    pub fn run(&self) -> Result<(), ClientError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyRunning);
        }
        let rx = self
            .inner
            .rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(ClientError::AlreadyRunning)?;

        let span = self.inner.span.clone();
        debug!(parent: &span, "Pump running");

        tokio::spawn(self.inner.clone().monitor().instrument(span.clone()));
        tokio::spawn(self.inner.clone().recv_loop().instrument(span.clone()));
        tokio::spawn(self.inner.clone().send_loop(rx).instrument(span.clone()));
        if let Some(keep_alive) = self.inner.config.effective_keep_alive() {
            tokio::spawn(self.inner.clone().ping_loop(keep_alive).instrument(span));
        }
        Ok(())
    }

    /// Queue a payload.
    ///
    /// Waits only while the outbound queue is full. Bound the wait with
    /// `tokio::time::timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Stopped`] once the pump has stopped.
    pub async fn write(&self, payload: impl Into<Bytes>) -> Result<(), ClientError> {
        self.inner.enqueue(Envelope::new(payload)).await
    }

    /// Queue a payload without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::QueueFull`] if the queue is full, or
    /// [`ClientError::Stopped`] once the pump has stopped.
    pub fn try_write(&self, payload: impl Into<Bytes>) -> Result<(), ClientError> {
        self.inner.try_enqueue(Envelope::new(payload))
    }

    /// Queue a payload and wait for its transport write.
    ///
    /// Dropping the future after the payload was queued does not unqueue it.
    ///
    /// # Errors
    ///
    /// Returns the write or compression error, or [`ClientError::Stopped`] if
    /// the pump stops before the payload is written.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), ClientError> {
        let (envelope, result) = Envelope::with_result(payload);
        self.inner.enqueue(envelope).await?;

        tokio::select! {
            biased;
            result = result => result.unwrap_or(Err(ClientError::Stopped)),
            _ = self.inner.cancel.cancelled() => Err(ClientError::Stopped),
        }
    }

    /// Stop the pump. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Wait until the pump has stopped.
    pub async fn stopped(&self) {
        self.inner.cancel.cancelled().await;
    }

    /// Whether the pump has stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl fmt::Debug for ConnectionPump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPump")
            .field("id", &self.inner.id)
            .field("address", &self.inner.config.address)
            .field("state", &self.state())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl PumpInner {
    fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!(parent: &self.span, "Pump stopping");
            self.cancel.cancel();
        }
    }

    async fn enqueue(&self, envelope: Envelope) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Stopped);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ClientError::Stopped),
            sent = self.tx.send(envelope) => sent.map_err(|_| ClientError::Stopped),
        }
    }

    fn try_enqueue(&self, envelope: Envelope) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Stopped);
        }
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ClientError::Stopped,
        })
    }

    /// Report a failure on connection generation `epoch`.
    fn disconnect(&self, epoch: u64) {
        if self.link.mark_disconnected(epoch) {
            info!(epoch, "Disconnected");
        } else {
            trace!(epoch, "Failure on a replaced connection ignored");
        }
    }

    async fn monitor(self: Arc<Self>) {
        let mut first = true;
        loop {
            if !first {
                if !self.link.disconnected(&self.cancel).await {
                    break;
                }
                self.close_retired().await;

                if !self.config.reconnect {
                    info!("Reconnect disabled");
                    self.stop();
                    break;
                }

                let backoff = self.config.reconnect_backoff;
                debug!(backoff_ms = backoff.as_millis() as u64, "Reconnecting after backoff");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            first = false;
            self.dial().await;
        }

        for conn in self.link.shutdown() {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Close failed");
            }
        }
        trace!("Monitor exited");
    }

    async fn dial(&self) {
        let dial = tokio::time::timeout(
            self.config.dial_timeout,
            self.dialer.dial(&self.config.address, &self.headers),
        );
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            result = dial => result,
        };

        match result {
            Ok(Ok(conn)) => {
                let epoch = self.link.install(conn);
                info!(epoch, dialer = self.dialer.name(), "Connected");
                for hook in &self.config.hooks.on_connect {
                    let hook = hook.clone();
                    tokio::spawn(async move { hook() }.in_current_span());
                }
            }
            Ok(Err(e)) => warn!(error = %e, "Dial failed"),
            Err(_) => warn!(
                timeout_ms = self.config.dial_timeout.as_millis() as u64,
                "Dial timed out"
            ),
        }
    }

    async fn close_retired(&self) {
        for conn in self.link.take_retired() {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Close failed");
            }
        }
    }

    async fn recv_loop(self: Arc<Self>) {
        while let Some(current) = self.link.connected(&self.cancel).await {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = current.lost.cancelled() => {
                    trace!(epoch = current.epoch, "Connection replaced, receive moves on");
                    continue;
                }
                result = current.conn.read_message() => result,
            };

            match result.and_then(|data| data.ok_or(TransportError::ConnectionClosed)) {
                Ok(data) => self.handle_inbound(data).await,
                Err(e) => {
                    warn!(error = %e, "Receive failed");
                    self.config.hooks.receive_failed(&e);
                    self.disconnect(current.epoch);
                }
            }
        }
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

        if let Some(reply) = self.config.hooks.received(data) {
            if let Err(e) = self.enqueue(Envelope::new(reply)).await {
                debug!(error = %e, "Reply dropped");
            }
        }
    }

    async fn send_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Envelope>) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            self.deliver(envelope).await;
        }

        rx.close();
        let mut pending = 0usize;
        while let Ok(mut envelope) = rx.try_recv() {
            envelope.complete(Err(ClientError::Stopped));
            pending += 1;
        }
        trace!(pending, "Send loop exited");
    }

    async fn deliver(&self, mut envelope: Envelope) {
        let hooks = &self.config.hooks;
        hooks.sending(&envelope.payload);

        let wire = match &self.config.send_codec {
            Some(codec) => match codec.compress(&envelope.payload) {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, codec = codec.name(), "Dropping payload that failed to compress");
                    envelope.complete(Err(e.into()));
                    return;
                }
            },
            None => envelope.payload.clone(),
        };

        let Some(current) = self.link.connected(&self.cancel).await else {
            envelope.complete(Err(ClientError::Stopped));
            return;
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                envelope.complete(Err(ClientError::Stopped));
                return;
            }
            result = current.conn.write_message(MessageKind::Binary, wire.clone()) => result,
            _ = current.lost.cancelled() => Err(TransportError::ConnectionClosed),
        };

        match result {
            Ok(()) => {
                hooks.sent(&wire);
                envelope.complete(Ok(()));
            }
            Err(e) => {
                warn!(error = %e, "Send failed");
                hooks.send_failed(&e);
                self.disconnect(current.epoch);
                envelope.complete(Err(e.into()));
            }
        }
    }

    async fn ping_loop(self: Arc<Self>, keep_alive: KeepAlive) {
        let start = tokio::time::Instant::now() + keep_alive.interval;
        let mut ticker = tokio::time::interval_at(start, keep_alive.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.link.state() != ConnectivityState::Connected {
                trace!("Keep-alive skipped while disconnected");
                continue;
            }
            if let Err(e) = self.try_enqueue(Envelope::new(keep_alive.payload.clone())) {
                debug!(error = %e, "Keep-alive skipped");
            }
        }
        trace!("Ping loop exited");
    }
}
