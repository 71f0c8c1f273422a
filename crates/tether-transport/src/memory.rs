//! In-process transport.
//!
//! Connections are pairs of bounded tokio channels. Closing either end closes
//! both, the way a TCP connection would. The memory transport is used to embed
//! a client and a server in one process and to drive the pumps in tests,
//! including failure injection (severed links, stalled writes, refused dials).

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::traits::{Connection, Dialer, MessageKind, TransportError};

/// Default per-direction buffer of a memory pair.
pub const DEFAULT_PAIR_CAPACITY: usize = 64;

/// One end of an in-process connection.
///
/// Cloning yields another handle to the same end.
#[derive(Clone)]
pub struct MemoryConnection {
    tx: mpsc::Sender<Bytes>,
    rx: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    closed: CancellationToken,
    stalled: Arc<AtomicBool>,
    written: Arc<AtomicUsize>,
    remote_addr: String,
}

/// Create a connected pair of memory connections.
///
/// `capacity` bounds each direction; a writer blocks once its peer has
/// `capacity` unread messages.
#[must_use]
pub fn pair(capacity: usize) -> (MemoryConnection, MemoryConnection) {
    let capacity = capacity.max(1);
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    let closed = CancellationToken::new();

    let end = |tx, rx, remote: &str| MemoryConnection {
        tx,
        rx: Arc::new(Mutex::new(rx)),
        closed: closed.clone(),
        stalled: Arc::new(AtomicBool::new(false)),
        written: Arc::new(AtomicUsize::new(0)),
        remote_addr: remote.to_string(),
    };

    let client = end(a_tx, a_rx, "memory:server");
    let server = end(b_tx, b_rx, "memory:client");
    (client, server)
}

impl MemoryConnection {
    /// Break the link in both directions, as a dropped network would.
    pub fn sever(&self) {
        debug!("Memory connection severed");
        self.closed.cancel();
    }

    /// Make every subsequent write from this end hang until the link closes.
    pub fn stall_writes(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Number of messages successfully written from this end.
    #[must_use]
    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn read_message(&self) -> Result<Option<Bytes>, TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            message = rx.recv() => Ok(message),
        }
    }

    async fn write_message(&self, _kind: MessageKind, data: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        if self.stalled.load(Ordering::SeqCst) {
            self.closed.cancelled().await;
            return Err(TransportError::ConnectionClosed);
        }

        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
            sent = self.tx.send(data) => {
                sent.map_err(|_| TransportError::ConnectionClosed)?;
                self.written.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.clone())
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

/// An accepted memory connection together with the dial headers.
pub struct Accepted {
    /// Address the client dialed.
    pub addr: String,
    /// Headers sent with the dial.
    pub headers: Vec<(String, String)>,
    /// Server end of the connection.
    pub connection: MemoryConnection,
}

impl Accepted {
    /// Look up a dial header by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Create a dialer and the listener receiving its connections.
#[must_use]
pub fn listen(capacity: usize) -> (MemoryDialer, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    let dialer = MemoryDialer {
        incoming: tx,
        capacity,
        refusing: Arc::new(AtomicBool::new(false)),
        dials: Arc::new(AtomicUsize::new(0)),
    };
    (dialer, MemoryListener { incoming: rx })
}

/// Dials into a [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryDialer {
    incoming: mpsc::UnboundedSender<Accepted>,
    capacity: usize,
    refusing: Arc<AtomicBool>,
    dials: Arc<AtomicUsize>,
}

impl MemoryDialer {
    /// Refuse (or accept again) subsequent dials.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of dial attempts, successful or not.
    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(
        &self,
        addr: &str,
        headers: &[(String, String)],
    ) -> Result<Arc<dyn Connection>, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::DialFailed(format!(
                "{}: connection refused",
                addr
            )));
        }

        let (client, server) = pair(self.capacity);
        self.incoming
            .send(Accepted {
                addr: addr.to_string(),
                headers: headers.to_vec(),
                connection: server,
            })
            .map_err(|_| TransportError::DialFailed(format!("{}: listener gone", addr)))?;

        Ok(Arc::new(client))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Receives connections dialed through a [`MemoryDialer`].
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<Accepted>,
}

impl MemoryListener {
    /// Wait for the next dialed connection.
    ///
    /// Returns `None` once every dialer has been dropped.
    pub async fn accept(&mut self) -> Option<Accepted> {
        self.incoming.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_duplex() {
        let (client, server) = pair(4);

        client
            .write_message(MessageKind::Binary, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        server
            .write_message(MessageKind::Binary, Bytes::from_static(b"world"))
            .await
            .unwrap();

        assert_eq!(server.read_message().await.unwrap().unwrap(), "hello");
        assert_eq!(client.read_message().await.unwrap().unwrap(), "world");
        assert_eq!(client.written(), 1);
    }

    #[tokio::test]
    async fn test_close_is_seen_by_both_ends() {
        let (client, server) = pair(4);
        client.close().await.unwrap();

        assert!(!server.is_open());
        assert!(server.read_message().await.unwrap().is_none());
        assert!(matches!(
            server
                .write_message(MessageKind::Binary, Bytes::from_static(b"x"))
                .await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_stalled_write_released_by_sever() {
        let (client, server) = pair(4);
        client.stall_writes(true);

        let writer = client.clone();
        let handle = tokio::spawn(async move {
            writer
                .write_message(MessageKind::Binary, Bytes::from_static(b"stuck"))
                .await
        });

        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        server.sever();
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_dialer_and_listener() {
        let (dialer, mut listener) = listen(8);
        let headers = vec![("X-Ws-ClientID".to_string(), "abc".to_string())];

        let conn = dialer.dial("memory://room", &headers).await.unwrap();
        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.addr, "memory://room");
        assert_eq!(accepted.header("x-ws-clientid"), Some("abc"));

        conn.write_message(MessageKind::Binary, Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(accepted.connection.read_message().await.unwrap().unwrap(), "hi");

        dialer.set_refusing(true);
        assert!(dialer.dial("memory://room", &[]).await.is_err());
        assert_eq!(dialer.dial_count(), 2);
    }
}
