//! # beacon-core
//!
//! Socket, channel and presence engine for the Beacon channels client.
//!
//! This crate provides the client-side building blocks:
//!
//! - **Socket** - One multiplexed connection with heartbeats
//! - **Channel** - Topic membership and event routing
//! - **Push** - Outbound request with reply correlation
//! - **Presence** - Synchronized per-topic member set
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Socket    │────▶│  Channel    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   │
//!                            ▼                   ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │    Push     │     │  Presence   │
//!                     └─────────────┘     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use beacon_core::{Socket, SocketConfig};
//! use beacon_protocol::Payload;
//! use beacon_transport::WebSocketTransport;
//! use std::sync::Arc;
//!
//! let transport = WebSocketTransport::with_url("wss://example.com/socket/websocket")?;
//! let socket = Socket::new(Arc::new(transport), SocketConfig::default());
//!
//! let lobby = socket.channel("room:lobby", Payload::new());
//! lobby.on("new_msg", |envelope| println!("{:?}", envelope.payload));
//! socket.on_connect(move || {
//!     lobby.join();
//! });
//! socket.connect();
//! ```

pub mod channel;
pub mod presence;
pub mod push;
pub mod reply;
pub mod socket;

#[cfg(test)]
pub(crate) mod mock;

pub use channel::{Channel, ChannelConfig, ChannelState, TransitionPolicy};
pub use presence::{DiffNotify, Meta, Presence, PresenceConfig, PresenceMap, SnapshotPolicy};
pub use push::{Push, PushFailure, ReceiveStatus, Reply};
pub use reply::ReplyError;
pub use socket::{PendingPushPolicy, Socket, SocketConfig, SocketHealth, HEARTBEAT_TARGET};
