//! Rooms: named groups of sockets sharing one broadcast queue.
//!
//! A single dispatcher task drains the broadcast queue. Each payload is
//! offered to every member with a non-blocking enqueue first; members whose
//! outbound queue is full are handed to a bounded task group for that payload,
//! so one stalled socket never delays the others.

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tether_transport::Connection;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, Instrument, Span};

use crate::socket::{Socket, SocketConfig, SocketError};

/// Default broadcast queue capacity.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Default number of concurrent sends for members with a full queue.
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 64;

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// The room has stopped.
    #[error("Room stopped")]
    Stopped,

    /// `run` was called twice.
    #[error("Room already running")]
    AlreadyRunning,

    /// Invalid configuration.
    #[error("Invalid room config: {0}")]
    InvalidConfig(&'static str),

    /// Socket creation failed.
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Broadcast queue capacity.
    pub broadcast_capacity: usize,
    /// Concurrent sends for members whose queue is full.
    pub dispatch_concurrency: usize,
    /// Configuration of sockets created through [`Room::new_socket`].
    pub socket: SocketConfig,
    /// Parent span for the room's own span.
    pub span: Span,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            socket: SocketConfig::default(),
            span: Span::none(),
        }
    }
}

impl RoomConfig {
    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero capacity or concurrency, or an invalid
    /// socket configuration.
    pub fn validate(&self) -> Result<(), RoomError> {
        if self.broadcast_capacity == 0 {
            return Err(RoomError::InvalidConfig("broadcast capacity must be > 0"));
        }
        if self.dispatch_concurrency == 0 {
            return Err(RoomError::InvalidConfig("dispatch concurrency must be > 0"));
        }
        self.socket.validate()?;
        Ok(())
    }
}

/// A named set of sockets.
///
/// Cloning yields another handle to the same room.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

struct RoomInner {
    id: String,
    sockets: DashMap<String, Socket>,
    config: RoomConfig,
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    running: AtomicBool,
    cancel: CancellationToken,
    span: Span,
}

impl Room {
    /// Create a room.
    ///
    /// The room's lifetime is a child of `parent` when given.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        id: impl Into<String>,
        config: RoomConfig,
        parent: Option<&CancellationToken>,
    ) -> Result<Self, RoomError> {
        config.validate()?;

        let id = id.into();
        let (tx, rx) = mpsc::channel(config.broadcast_capacity);
        let cancel = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let span = info_span!(parent: &config.span, "room", room = %id);

        Ok(Self {
            inner: Arc::new(RoomInner {
                id,
                sockets: DashMap::new(),
                config,
                tx,
                rx: Mutex::new(Some(rx)),
                running: AtomicBool::new(false),
                cancel,
                span,
            }),
        })
    }

    /// Room identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Start the broadcast dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::AlreadyRunning`] on a second call.
    pub fn run(&self) -> Result<(), RoomError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(RoomError::AlreadyRunning);
        }
        let rx = self
            .inner
            .rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(RoomError::AlreadyRunning)?;

        debug!(parent: &self.inner.span, "Room running");
        let span = self.inner.span.clone();
        tokio::spawn(self.inner.clone().dispatch(rx).instrument(span));
        Ok(())
    }

    /// Register a socket.
    ///
    /// The socket is removed again once either it or the room stops. A socket
    /// already registered under the same identifier is replaced.
    pub fn add(&self, socket: Socket) {
        let id = socket.id().to_string();
        trace!(parent: &self.inner.span, socket = %id, "Socket joined");
        if let Some(previous) = self.inner.sockets.insert(id.clone(), socket.clone()) {
            debug!(parent: &self.inner.span, socket = %id, "Replaced socket with the same id");
            previous.stop();
        }

        let inner = self.inner.clone();
        let span = self.inner.span.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = inner.cancel.cancelled() => {}
                    _ = socket.stopped() => {}
                }
                if inner.sockets.remove_if(&id, |_, s| s.ptr_eq(&socket)).is_some() {
                    trace!(socket = %id, "Socket left");
                }
            }
            .instrument(span),
        );
    }

    /// Create, start and register a socket over an accepted connection.
    ///
    /// The socket stops when the room stops.
    ///
    /// # Errors
    ///
    /// Returns an error if the room has stopped or the socket configuration is
    /// invalid.
    pub fn new_socket(
        &self,
        id: impl Into<String>,
        conn: Arc<dyn Connection>,
    ) -> Result<Socket, RoomError> {
        if self.is_stopped() {
            return Err(RoomError::Stopped);
        }

        let mut config = self.inner.config.socket.clone();
        config.span = self.inner.span.clone();
        let socket = Socket::new(id, conn, config, Some(&self.inner.cancel))?;
        socket.run()?;
        self.add(socket.clone());
        Ok(socket)
    }

    /// Queue a payload for every member.
    ///
    /// Waits only while the broadcast queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Stopped`] once the room has stopped.
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> Result<(), RoomError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(RoomError::Stopped);
        }
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => Err(RoomError::Stopped),
            sent = inner.tx.send(payload.into()) => sent.map_err(|_| RoomError::Stopped),
        }
    }

    /// Look up a member.
    #[must_use]
    pub fn socket(&self, id: &str) -> Option<Socket> {
        self.inner.sockets.get(id).map(|s| s.value().clone())
    }

    /// Snapshot of the current members.
    #[must_use]
    pub fn sockets(&self) -> Vec<Socket> {
        self.inner.sockets.iter().map(|s| s.value().clone()).collect()
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sockets.len()
    }

    /// Whether the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.sockets.is_empty()
    }

    /// Stop the room and every member created through it. Idempotent.
    pub fn stop(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!(parent: &self.inner.span, members = self.len(), "Room stopping");
            self.inner.cancel.cancel();
        }
    }

    /// Wait until the room has stopped.
    pub async fn stopped(&self) {
        self.inner.cancel.cancelled().await;
    }

    /// Whether the room has stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.inner.id)
            .field("members", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl RoomInner {
    async fn dispatch(self: Arc<Self>, mut rx: mpsc::Receiver<Bytes>) {
        loop {
            let payload = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                payload = rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };
            self.fan_out(payload);
        }
        trace!("Dispatcher exited");
    }

    fn fan_out(&self, payload: Bytes) {
        // Collect first: no await while holding a map guard.
        let mut backlog = Vec::new();
        let mut delivered = 0usize;
        for entry in self.sockets.iter() {
            match entry.value().try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(SocketError::QueueFull) => backlog.push(entry.value().clone()),
                Err(_) => {}
            }
        }
        trace!(delivered, backlog = backlog.len(), "Broadcast dispatched");

        if backlog.is_empty() {
            return;
        }

        let limit = self.config.dispatch_concurrency;
        let cancel = self.cancel.clone();
        tokio::spawn(
            async move {
                let sends = stream::iter(backlog).for_each_concurrent(limit, |socket| {
                    let payload = payload.clone();
                    async move {
                        if let Err(e) = socket.send(payload).await {
                            trace!(socket = %socket.id(), error = %e, "Broadcast send skipped");
                        }
                    }
                });
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sends => {}
                }
            }
            .in_current_span(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_transport::memory::{self, MemoryConnection};

    fn room() -> Room {
        let room = Room::new("room-1", RoomConfig::default(), None).unwrap();
        room.run().unwrap();
        room
    }

    fn join(room: &Room, id: &str) -> (Socket, MemoryConnection) {
        let (client, server) = memory::pair(64);
        let socket = room.new_socket(id, Arc::new(server)).unwrap();
        (socket, client)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_config_validation() {
        let config = RoomConfig {
            dispatch_concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(Room::new("r", config, None), Err(RoomError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member() {
        let room = room();
        let members: Vec<_> = ["a", "b", "c"].iter().map(|id| join(&room, id)).collect();
        assert_eq!(room.len(), 3);

        room.broadcast("hello").await.unwrap();
        for (_, client) in &members {
            assert_eq!(client.read_message().await.unwrap().unwrap(), "hello");
        }
        assert!(matches!(room.run(), Err(RoomError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_stalled_member_does_not_block_others() {
        let config = RoomConfig {
            socket: SocketConfig {
                send_queue_capacity: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let room = Room::new("room-1", config, None).unwrap();
        room.run().unwrap();

        let (_client_a, server_a) = memory::pair(64);
        server_a.stall_writes(true);
        room.new_socket("a", Arc::new(server_a.clone())).unwrap();
        let (_b, client_b) = join(&room, "b");
        let (_c, client_c) = join(&room, "c");

        for i in 0..10u8 {
            room.broadcast(vec![i]).await.unwrap();
        }

        // Members with a full queue are served concurrently, so order may vary.
        for client in [&client_b, &client_c] {
            let mut seen = Vec::new();
            for _ in 0..10 {
                let data = tokio::time::timeout(Duration::from_secs(5), client.read_message())
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
                seen.push(data[0]);
            }
            seen.sort_unstable();
            assert_eq!(seen, (0..10u8).collect::<Vec<_>>());
        }
        assert_eq!(server_a.written(), 0);
        assert!(room.socket("a").is_some());
    }

    #[tokio::test]
    async fn test_members_deregister_on_stop() {
        let room = room();
        let (a, _client_a) = join(&room, "a");
        let (_b, client_b) = join(&room, "b");

        a.stop();
        settle().await;
        assert!(room.socket("a").is_none());
        assert_eq!(room.len(), 1);

        client_b.close().await.unwrap();
        settle().await;
        assert!(room.is_empty());
    }

    #[tokio::test]
    async fn test_room_stop_stops_members() {
        let room = room();
        let (a, client_a) = join(&room, "a");

        room.stop();
        a.stopped().await;
        settle().await;

        assert!(room.is_empty());
        assert!(client_a.read_message().await.unwrap().is_none());
        assert!(matches!(room.broadcast("late").await, Err(RoomError::Stopped)));
        assert!(matches!(
            room.new_socket("b", Arc::new(memory::pair(1).1)),
            Err(RoomError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_replaced_socket_keeps_new_registration() {
        let room = room();
        let (first, _c1) = join(&room, "same");
        let (second, _c2) = join(&room, "same");

        first.stopped().await;
        settle().await;
        let current = room.socket("same").unwrap();
        assert!(current.ptr_eq(&second));
    }
}
