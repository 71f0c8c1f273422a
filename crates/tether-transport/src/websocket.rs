//! WebSocket transport implementation.
//!
//! Client connections are dialed with tokio-tungstenite; server connections
//! wrap sockets upgraded by axum. Both split the stream so the read half and
//! the write half are locked independently.

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        protocol::WebSocketConfig as TungsteniteConfig,
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::traits::{Connection, Dialer, MessageKind, TransportError};

/// Default inbound message limit (64 KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket dialer configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Disable Nagle's algorithm on the TCP stream.
    pub nodelay: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            nodelay: true,
        }
    }
}

/// Dials `ws://` and `wss://` endpoints.
#[derive(Debug, Clone, Default)]
pub struct WebSocketDialer {
    config: WebSocketConfig,
}

impl WebSocketDialer {
    /// Create a new dialer.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(
        &self,
        addr: &str,
        headers: &[(String, String)],
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let mut request = addr
            .into_client_request()
            .map_err(|e| TransportError::DialFailed(e.to_string()))?;

        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::DialFailed(format!("bad header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::DialFailed(format!("bad header value: {}", e)))?;
            request.headers_mut().append(name, value);
        }

        let mut ws_config = TungsteniteConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);

        let (stream, response) = connect_async_with_config(request, Some(ws_config), self.config.nodelay)
            .await
            .map_err(|e| TransportError::DialFailed(e.to_string()))?;

        debug!(addr = %addr, status = %response.status(), "WebSocket handshake completed");

        Ok(Arc::new(ClientConnection::new(
            stream,
            addr.to_string(),
            self.config.max_message_size,
        )))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A dialed WebSocket connection.
pub struct ClientConnection {
    sink: Mutex<SplitSink<ClientStream, Message>>,
    stream: Mutex<SplitStream<ClientStream>>,
    remote_addr: String,
    is_open: AtomicBool,
    max_message_size: usize,
}

impl ClientConnection {
    fn new(stream: ClientStream, remote_addr: String, max_message_size: usize) -> Self {
        let (sink, stream) = stream.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            remote_addr,
            is_open: AtomicBool::new(true),
            max_message_size,
        }
    }

    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                len, self.max_message_size
            );
            return Err(TransportError::MessageTooLarge {
                size: len,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for ClientConnection {
    async fn read_message(&self) -> Result<Option<Bytes>, TransportError> {
        let mut stream = self.stream.lock().await;

        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    return Ok(Some(Bytes::from(data)));
                }
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(Bytes::from(text)));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    // tungstenite queues the pong reply itself
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn write_message(&self, kind: MessageKind, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match kind {
            MessageKind::Binary => Message::Binary(data.to_vec()),
            MessageKind::Text => Message::Text(
                String::from_utf8(data.to_vec())
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?,
            ),
        };

        let mut sink = self.sink.lock().await;
        sink.send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        let mut sink = self.sink.lock().await;
        sink.close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.clone())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

/// A server-side connection upgraded by axum.
pub struct UpgradedConnection {
    sink: Mutex<SplitSink<WebSocket, AxumMessage>>,
    stream: Mutex<SplitStream<WebSocket>>,
    remote_addr: Option<String>,
    is_open: AtomicBool,
}

impl UpgradedConnection {
    /// Wrap an upgraded socket.
    ///
    /// The inbound size limit is enforced by the upgrade itself
    /// (`WebSocketUpgrade::max_message_size`).
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<String>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            remote_addr,
            is_open: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Connection for UpgradedConnection {
    async fn read_message(&self) -> Result<Option<Bytes>, TransportError> {
        let mut stream = self.stream.lock().await;

        loop {
            match stream.next().await {
                Some(Ok(AxumMessage::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(AxumMessage::Text(text))) => return Ok(Some(Bytes::from(text))),
                Some(Ok(AxumMessage::Ping(_) | AxumMessage::Pong(_))) => {
                    // answered by the underlying protocol handler
                }
                Some(Ok(AxumMessage::Close(_))) | None => {
                    debug!("WebSocket stream ended");
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn write_message(&self, kind: MessageKind, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match kind {
            MessageKind::Binary => AxumMessage::Binary(data.to_vec()),
            MessageKind::Text => AxumMessage::Text(
                String::from_utf8(data.to_vec())
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?,
            ),
        };

        let mut sink = self.sink.lock().await;
        sink.send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut sink = self.sink.lock().await;
        sink.close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}
