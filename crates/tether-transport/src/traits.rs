//! Transport abstraction traits for tether.
//!
//! A transport hands the pumps an already-established duplex connection that
//! reads and writes whole messages. Framing, handshakes and the dial/upgrade
//! procedure live behind these traits.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Request header carrying the caller-chosen client identifier.
pub const CLIENT_ID_HEADER: &str = "X-Ws-ClientID";

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Dialing the remote endpoint failed.
    #[error("Dial failed: {0}")]
    DialFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Inbound message exceeds the configured limit.
    #[error("Message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge {
        /// Size of the offending message.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Kind of data message written to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind {
    /// Opaque binary payload.
    #[default]
    Binary,
    /// UTF-8 text payload.
    Text,
}

/// An established duplex connection.
///
/// Reads and writes may run concurrently from different tasks: a receive loop
/// can sit in [`read_message`](Connection::read_message) while a send loop
/// writes. Implementations keep the two directions independently locked.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Read the next data message.
    ///
    /// Control frames are handled internally. Returns `Ok(None)` once the
    /// connection is closed cleanly.
    async fn read_message(&self) -> Result<Option<Bytes>, TransportError>;

    /// Write one data message.
    async fn write_message(&self, kind: MessageKind, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

/// Something that can establish client-side connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `addr`, sending `headers` with the opening handshake.
    ///
    /// The caller bounds the call with its own dial timeout.
    async fn dial(
        &self,
        addr: &str,
        headers: &[(String, String)],
    ) -> Result<Arc<dyn Connection>, TransportError>;

    /// Get the dialer name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::MessageTooLarge {
            size: 2048,
            limit: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Message of 2048 bytes exceeds limit of 1024 bytes"
        );
        assert_eq!(MessageKind::default(), MessageKind::Binary);
    }
}
