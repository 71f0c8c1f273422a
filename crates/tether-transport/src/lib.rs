//! # tether-transport
//!
//! Duplex connection abstraction for tether.
//!
//! The pumps never speak a wire protocol themselves. They consume:
//!
//! - **[`Dialer`]** - establishes a client-side [`Connection`]
//! - **[`Connection`]** - whole-message `read_message` / `write_message` / `close`
//!
//! Provided implementations:
//!
//! - **WebSocket** - tokio-tungstenite client dialing, axum server upgrades
//! - **Memory** - in-process pairs for embedding and testing
//!
//! ```rust,ignore
//! use tether_transport::{Connection, MessageKind};
//!
//! async fn echo(conn: &dyn Connection) {
//!     while let Ok(Some(data)) = conn.read_message().await {
//!         let _ = conn.write_message(MessageKind::Binary, data).await;
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, Dialer, MessageKind, TransportError, CLIENT_ID_HEADER};

#[cfg(feature = "websocket")]
pub use websocket::{UpgradedConnection, WebSocketConfig, WebSocketDialer};
