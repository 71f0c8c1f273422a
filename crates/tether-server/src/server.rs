//! Room and socket registry.
//!
//! A [`Server`] maps request paths to rooms and connection identifiers to
//! sockets. Rooms and sockets remove themselves from the registries when their
//! lifetime ends; a room's lifetime is a child of the server's, a socket's a
//! child of its room's.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tether_core::{IdGenerator, Room, RoomConfig, RoomError, Socket};
use tether_transport::websocket::DEFAULT_MAX_MESSAGE_SIZE;
use tether_transport::Connection;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use crate::handlers;
use crate::metrics::{self, SocketMetricsGuard};

/// Called with every socket once it is registered.
pub type SocketHook = Arc<dyn Fn(&Socket) + Send + Sync>;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A room is already registered for the path.
    #[error("Path already registered: {0}")]
    PathExists(String),

    /// The path cannot carry a room.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// No free identifier after the bounded retries.
    #[error("Identifier space exhausted")]
    IdExhausted,

    /// The server has stopped.
    #[error("Server stopped")]
    Stopped,

    /// Room creation failed.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// Binding or serving failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerOptions {
    /// Listen address used by [`Server::run`].
    pub addr: SocketAddr,
    /// Inbound message size limit for upgraded connections.
    pub max_message_size: usize,
    /// Called with every registered socket.
    pub on_new_socket: Option<SocketHook>,
    /// Parent span for the server's own span.
    pub span: Span,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            on_new_socket: None,
            span: Span::none(),
        }
    }
}

impl ServerOptions {
    /// Set the new-socket hook.
    #[must_use]
    pub fn on_new_socket(mut self, f: impl Fn(&Socket) + Send + Sync + 'static) -> Self {
        self.on_new_socket = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("addr", &self.addr)
            .field("max_message_size", &self.max_message_size)
            .field("on_new_socket", &self.on_new_socket.is_some())
            .finish()
    }
}

/// Room and socket registry with a WebSocket upgrade endpoint.
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    options: ServerOptions,
    ids: IdGenerator,
    paths: DashMap<String, String>,
    rooms: DashMap<String, Room>,
    sockets: DashMap<String, Socket>,
    local_addr: OnceLock<SocketAddr>,
    cancel: CancellationToken,
    span: Span,
}

impl Server {
    /// Create a server.
    ///
    /// The server's lifetime is a child of `parent` when given.
    #[must_use]
    pub fn new(options: ServerOptions, parent: Option<&CancellationToken>) -> Self {
        let cancel = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let span = info_span!(parent: &options.span, "server", addr = %options.addr);

        Self {
            inner: Arc::new(ServerInner {
                options,
                ids: IdGenerator::default(),
                paths: DashMap::new(),
                rooms: DashMap::new(),
                sockets: DashMap::new(),
                local_addr: OnceLock::new(),
                cancel,
                span,
            }),
        }
    }

    /// Create and start a room that accepts upgrades on `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::PathExists`] if the path already has a room,
    /// [`ServerError::InvalidPath`] for a reserved or relative path, or any
    /// error from [`Server::new_room`].
    pub fn register_path(&self, path: impl Into<String>, config: RoomConfig) -> Result<Room, ServerError> {
        let path = path.into();
        if !path.starts_with('/') || path == handlers::HEALTH_PATH {
            return Err(ServerError::InvalidPath(path));
        }

        match self.inner.paths.entry(path.clone()) {
            Entry::Occupied(_) => Err(ServerError::PathExists(path)),
            Entry::Vacant(slot) => {
                let room = self.new_room(config)?;
                slot.insert(room.id().to_string());
                info!(parent: &self.inner.span, path = %path, room = %room.id(), "Path registered");
                Ok(room)
            }
        }
    }

    /// Create and start a room that is not bound to a path.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] once the server has stopped,
    /// [`ServerError::IdExhausted`] if no free room id was found, or the room's
    /// configuration error.
    pub fn new_room(&self, mut config: RoomConfig) -> Result<Room, ServerError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(ServerError::Stopped);
        }

        let id = inner
            .ids
            .next_unique(str::to_string, |id| inner.rooms.contains_key(id))
            .ok_or(ServerError::IdExhausted)?;

        config.span = inner.span.clone();
        let room = Room::new(id.clone(), config, Some(&inner.cancel))?;
        room.run()?;
        inner.rooms.insert(id.clone(), room.clone());
        metrics::set_active_rooms(inner.rooms.len());

        let registry = inner.clone();
        let watched = room.clone();
        tokio::spawn(
            async move {
                watched.stopped().await;
                registry.rooms.remove_if(&id, |_, r| r.id() == watched.id());
                registry.paths.retain(|_, room_id| *room_id != id);
                metrics::set_active_rooms(registry.rooms.len());
                debug!(room = %id, "Room removed");
            }
            .instrument(inner.span.clone()),
        );

        Ok(room)
    }

    /// Look up a room by identifier.
    #[must_use]
    pub fn room_by_id(&self, id: &str) -> Option<Room> {
        self.inner.rooms.get(id).map(|r| r.value().clone())
    }

    /// Look up the room registered for `path`.
    #[must_use]
    pub fn room_by_path(&self, path: &str) -> Option<Room> {
        let id = self.inner.paths.get(path).map(|id| id.value().clone())?;
        self.room_by_id(&id)
    }

    /// Snapshot of every running room.
    #[must_use]
    pub fn rooms(&self) -> Vec<Room> {
        self.inner.rooms.iter().map(|r| r.value().clone()).collect()
    }

    /// Look up a socket by connection identifier.
    #[must_use]
    pub fn socket(&self, id: &str) -> Option<Socket> {
        self.inner.sockets.get(id).map(|s| s.value().clone())
    }

    /// Number of registered sockets.
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.inner.sockets.len()
    }

    /// Whether `path` has a registered room.
    #[must_use]
    pub fn has_path(&self, path: &str) -> bool {
        self.inner.paths.contains_key(path)
    }

    /// Generate a connection identifier for `client_id` that no registered
    /// socket uses yet.
    pub(crate) fn next_connection_id(&self, client_id: &str) -> Option<String> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.inner.ids.next_unique(
            |raw| format!("{}-{}-{}", now, client_id, raw),
            |id| self.inner.sockets.contains_key(id),
        )
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.inner.options.max_message_size
    }

    /// Bind a connection to the room registered for `path`.
    ///
    /// Resolves once the socket has stopped. Without a room for `path` the
    /// connection is closed immediately.
    pub async fn add_socket(&self, path: &str, id: String, conn: Arc<dyn Connection>) {
        let Some(room) = self.room_by_path(path) else {
            warn!(parent: &self.inner.span, path = %path, "No room for path, closing connection");
            metrics::record_rejection("unknown_path");
            close(conn).await;
            return;
        };

        let socket = match room.new_socket(id.clone(), conn.clone()) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(parent: &self.inner.span, path = %path, error = %e, "Socket creation failed");
                metrics::record_error("socket");
                close(conn).await;
                return;
            }
        };

        let _metrics = SocketMetricsGuard::new();
        self.inner.sockets.insert(id.clone(), socket.clone());
        info!(parent: &self.inner.span, socket = %id, room = %room.id(), from = %socket.remote_addr(), "Socket registered");

        if let Some(hook) = &self.inner.options.on_new_socket {
            hook(&socket);
        }

        socket.stopped().await;
        self.inner.sockets.remove_if(&id, |_, s| s.ptr_eq(&socket));
        debug!(parent: &self.inner.span, socket = %id, "Socket deregistered");
    }

    /// Queue a payload on every room.
    pub async fn broadcast_room(&self, payload: impl Into<Bytes>) {
        let payload = payload.into();
        let rooms = self.rooms();
        let sends = rooms.iter().map(|room| {
            let payload = payload.clone();
            async move {
                match room.broadcast(payload).await {
                    Ok(()) => metrics::record_broadcast(room.id()),
                    Err(e) => trace!(room = %room.id(), error = %e, "Broadcast skipped"),
                }
            }
        });
        join_all(sends).await;
    }

    /// Queue a payload on one room. Unknown rooms are ignored.
    pub async fn send_to_room(&self, room_id: &str, payload: impl Into<Bytes>) {
        let Some(room) = self.room_by_id(room_id) else {
            return;
        };
        match room.broadcast(payload).await {
            Ok(()) => metrics::record_broadcast(room.id()),
            Err(e) => trace!(room = %room_id, error = %e, "Broadcast skipped"),
        }
    }

    /// Queue a payload on one socket. Unknown sockets are ignored.
    pub async fn send_to_socket(&self, socket_id: &str, payload: impl Into<Bytes>) {
        let Some(socket) = self.socket(socket_id) else {
            return;
        };
        if let Err(e) = socket.send(payload).await {
            trace!(socket = %socket_id, error = %e, "Send skipped");
        }
    }

    /// Router serving every registered path plus the health endpoint.
    #[must_use]
    pub fn router(&self) -> axum::Router {
        handlers::router(self.clone())
    }

    /// Bind the configured address and serve until stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or serving fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.inner.options.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if serving fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        let _ = self.inner.local_addr.set(addr);
        info!(parent: &self.inner.span, %addr, "Tether server listening");

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(self.inner.cancel.clone().cancelled_owned())
            .await?;

        info!(parent: &self.inner.span, "Tether server stopped");
        Ok(())
    }

    /// Address the server is serving on, once bound.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// Stop the server, every room and every socket. Idempotent.
    pub fn stop(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!(parent: &self.inner.span, rooms = self.inner.rooms.len(), sockets = self.socket_count(), "Server stopping");
            self.inner.cancel.cancel();
        }
    }

    /// Wait until the server has stopped.
    pub async fn stopped(&self) {
        self.inner.cancel.cancelled().await;
    }

    /// Whether the server has stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.inner.options.addr)
            .field("rooms", &self.inner.rooms.len())
            .field("sockets", &self.inner.sockets.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

async fn close(conn: Arc<dyn Connection>) {
    if let Err(e) = conn.close().await {
        debug!(error = %e, "Close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_transport::memory;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_register_path() {
        let server = Server::new(ServerOptions::default(), None);
        let room = server.register_path("/chat", RoomConfig::default()).unwrap();

        assert_eq!(server.room_by_path("/chat").unwrap().id(), room.id());
        assert!(server.room_by_id(room.id()).is_some());
        assert!(matches!(
            server.register_path("/chat", RoomConfig::default()),
            Err(ServerError::PathExists(_))
        ));
        assert!(matches!(
            server.register_path("/health", RoomConfig::default()),
            Err(ServerError::InvalidPath(_))
        ));
        assert!(matches!(
            server.register_path("chat", RoomConfig::default()),
            Err(ServerError::InvalidPath(_))
        ));
        assert_eq!(server.rooms().len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_room_leaves_registries() {
        let server = Server::new(ServerOptions::default(), None);
        let room = server.register_path("/chat", RoomConfig::default()).unwrap();

        room.stop();
        settle().await;
        assert!(server.room_by_id(room.id()).is_none());
        assert!(!server.has_path("/chat"));

        // The path can be registered again.
        server.register_path("/chat", RoomConfig::default()).unwrap();
    }

    #[tokio::test]
    async fn test_add_socket_registers_and_deregisters() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let options = ServerOptions::default().on_new_socket(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let server = Server::new(options, None);
        let room = server.register_path("/chat", RoomConfig::default()).unwrap();

        let (client, conn) = memory::pair(8);
        let task = tokio::spawn({
            let server = server.clone();
            async move { server.add_socket("/chat", "conn-1".to_string(), Arc::new(conn)).await }
        });
        settle().await;

        assert_eq!(server.socket_count(), 1);
        assert_eq!(room.len(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        server.send_to_socket("conn-1", "direct").await;
        server.send_to_socket("missing", "ignored").await;
        assert_eq!(client.read_message().await.unwrap().unwrap(), "direct");

        client.close().await.unwrap();
        task.await.unwrap();
        settle().await;
        assert_eq!(server.socket_count(), 0);
        assert!(room.is_empty());
    }

    #[tokio::test]
    async fn test_add_socket_without_room_closes() {
        let server = Server::new(ServerOptions::default(), None);
        let (client, conn) = memory::pair(8);

        server.add_socket("/nowhere", "conn-1".to_string(), Arc::new(conn)).await;
        assert!(client.read_message().await.unwrap().is_none());
        assert_eq!(server.socket_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_room_reaches_every_room() {
        let server = Server::new(ServerOptions::default(), None);
        server.register_path("/a", RoomConfig::default()).unwrap();
        server.register_path("/b", RoomConfig::default()).unwrap();
        let detached = server.new_room(RoomConfig::default()).unwrap();

        let mut clients = Vec::new();
        for (i, path) in ["/a", "/b"].iter().enumerate() {
            let (client, conn) = memory::pair(8);
            let server = server.clone();
            let path = path.to_string();
            tokio::spawn(async move { server.add_socket(&path, format!("c{}", i), Arc::new(conn)).await });
            clients.push(client);
        }
        let (detached_client, detached_conn) = memory::pair(8);
        detached.new_socket("d", Arc::new(detached_conn)).unwrap();
        settle().await;

        server.broadcast_room("all").await;
        for client in clients.iter().chain(std::iter::once(&detached_client)) {
            assert_eq!(client.read_message().await.unwrap().unwrap(), "all");
        }

        server.send_to_room(detached.id(), "only-d").await;
        server.send_to_room("missing", "ignored").await;
        assert_eq!(detached_client.read_message().await.unwrap().unwrap(), "only-d");
    }

    #[tokio::test]
    async fn test_stop_cascades() {
        let server = Server::new(ServerOptions::default(), None);
        let room = server.register_path("/chat", RoomConfig::default()).unwrap();
        let (client, conn) = memory::pair(8);
        let socket = room.new_socket("s", Arc::new(conn)).unwrap();

        server.stop();
        room.stopped().await;
        socket.stopped().await;
        assert!(client.read_message().await.unwrap().is_none());
        assert!(matches!(server.new_room(RoomConfig::default()), Err(ServerError::Stopped)));

        settle().await;
        assert!(server.rooms().is_empty());
    }
}
