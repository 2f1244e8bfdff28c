//! # beacon-transport
//!
//! Transport provider abstraction for the Beacon channels client.
//!
//! The socket engine never talks to the network itself. It drives a
//! [`Transport`] and consumes the [`TransportEvent`]s the transport emits:
//!
//! - **Connected** - the stream is open
//! - **Disconnected** - the stream closed or the attempt failed
//! - **Message** - a text frame arrived
//!
//! ```rust,ignore
//! use beacon_transport::{event_channel, Transport, TransportEvent, WebSocketTransport};
//!
//! let transport = WebSocketTransport::with_url("wss://example.com/socket/websocket")?;
//! let (tx, mut rx) = event_channel();
//! transport.connect(tx);
//!
//! while let Some(event) = rx.recv().await {
//!     // Process event
//! }
//! ```

pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{
    event_channel, EventReceiver, EventSender, Transport, TransportError, TransportEvent,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
