//! # tether-core
//!
//! Server-side half of tether.
//!
//! - **[`Socket`]** - per-connection pump with a heartbeat idle timeout
//! - **[`Room`]** - named set of sockets sharing one broadcast queue
//! - **[`Hooks`]** - user callbacks, shared with the client pump
//! - **[`IdGenerator`]** - registry-owned identifier source
//!
//! ```rust,ignore
//! use tether_core::{Room, RoomConfig};
//!
//! let room = Room::new("lobby", RoomConfig::default(), None)?;
//! room.run()?;
//! room.new_socket("conn-1", connection)?;
//! room.broadcast("hello").await?;
//! ```

pub mod hooks;
pub mod id;
pub mod room;
pub mod socket;

pub use hooks::{ConnectHook, ErrorHook, Hooks, PayloadHook, ReceiveHandler};
pub use id::{IdGenerator, DEFAULT_ID_LENGTH, MAX_ID_RETRIES};
pub use room::{Room, RoomConfig, RoomError, DEFAULT_BROADCAST_CAPACITY, DEFAULT_DISPATCH_CONCURRENCY};
pub use socket::{
    Socket, SocketConfig, SocketError, SocketInfo, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_HEARTBEAT_PAYLOAD, DEFAULT_SEND_QUEUE_CAPACITY,
};
