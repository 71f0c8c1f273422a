//! # tether-server
//!
//! Room registry and WebSocket upgrade endpoint for tether.
//!
//! ```rust,ignore
//! use tether_core::RoomConfig;
//! use tether_server::{Server, ServerOptions};
//!
//! let server = Server::new(ServerOptions::default(), None);
//! let chat = server.register_path("/chat", RoomConfig::default())?;
//! tokio::spawn({
//!     let server = server.clone();
//!     async move { server.run().await }
//! });
//! chat.broadcast("hello").await?;
//! ```

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod server;

pub use config::{Config, ConfigError, RoomEntry};
pub use server::{Server, ServerError, ServerOptions, SocketHook};
