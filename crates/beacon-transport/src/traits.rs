//! Transport abstraction traits for Beacon.
//!
//! A transport owns one physical text stream. It never calls back into its
//! owner directly: every connection outcome and inbound frame is delivered as
//! a [`TransportEvent`] on the sender handed to [`Transport::connect`].

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer or the client closed the connection.
    #[error("Disconnected: {reason} (code {code})")]
    Disconnection {
        /// Close reason.
        reason: String,
        /// Close code.
        code: i32,
    },

    /// Reading from the stream failed.
    #[error("Receive failed: {reason} (code {code})")]
    ReceiveFailure {
        /// Failure description.
        reason: String,
        /// Error code, `0` when none is available.
        code: i32,
    },

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection attempt timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The endpoint URL is not usable.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A notification from a transport to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// The stream is open.
    Connected,
    /// The stream closed, or a connection attempt failed.
    Disconnected(Option<TransportError>),
    /// A text frame arrived.
    Message(String),
}

/// Sending half of a transport's event stream.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of a transport's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create an event stream for a transport.
#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// A client transport carrying text frames.
///
/// `connect` and `disconnect` return immediately; their outcome is reported
/// through the event stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting. Events for this connection go to `events`.
    fn connect(&self, events: EventSender);

    /// Tear the connection down.
    ///
    /// Emits [`TransportEvent::Disconnected`] if a connection was established.
    /// A connection attempt still in flight is abandoned without an event.
    fn disconnect(&self);

    /// Write one frame to the stream.
    async fn write(&self, data: Bytes) -> Result<(), TransportError>;

    /// Whether the stream is currently open.
    fn is_connected(&self) -> bool;

    /// The endpoint this transport connects to.
    fn url(&self) -> &str;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}
