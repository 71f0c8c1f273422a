//! # tether-client
//!
//! Reconnecting client half of tether.
//!
//! A [`ConnectionPump`] dials an endpoint, keeps the connection alive across
//! failures with a fixed backoff, and exposes a queued [`write`] plus a
//! [`send`] that waits for the transport write.
//!
//! ```rust,ignore
//! use tether_client::{ConnectionPump, PumpConfig};
//! use std::time::Duration;
//!
//! let config = PumpConfig::new("ws://localhost:9000/chat")
//!     .with_keep_alive("ping", Duration::from_secs(10));
//! let pump = ConnectionPump::websocket(config)?;
//! pump.run()?;
//! pump.send("hello").await?;
//! ```
//!
//! [`write`]: ConnectionPump::write
//! [`send`]: ConnectionPump::send

pub mod config;
pub mod envelope;
pub mod pump;
pub mod state;

pub use config::{
    KeepAlive, PumpConfig, DEFAULT_DIAL_TIMEOUT, DEFAULT_RECONNECT_BACKOFF,
    DEFAULT_SEND_QUEUE_CAPACITY, MIN_KEEP_ALIVE_INTERVAL,
};
pub use envelope::Envelope;
pub use pump::{ClientError, ConnectionPump};
pub use state::ConnectivityState;
