//! Outbound pushes and their reply correlation.
//!
//! A [`Push`] is one outbound envelope plus the callbacks waiting for its
//! reply. It resolves exactly once: from a server reply, or locally when the
//! envelope could not be sent.

use beacon_protocol::events::{event, HEARTBEAT_REF_PREFIX, PHOENIX_TOPIC};
use beacon_protocol::{Envelope, Payload};
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Callback fired with the reply payload.
pub type ReceiveCallback = Box<dyn FnOnce(&Payload) + Send>;

/// Callback fired on any resolution.
pub type AlwaysCallback = Box<dyn FnOnce() + Send>;

/// Generate a fresh push ref.
#[must_use]
pub fn generate_ref() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a fresh heartbeat ref.
#[must_use]
pub fn generate_heartbeat_ref() -> String {
    format!("{}{}", HEARTBEAT_REF_PREFIX, uuid::Uuid::new_v4())
}

/// Reply status a callback can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReceiveStatus {
    /// `status == "ok"`.
    Ok,
    /// `status == "error"`.
    Error,
    /// Any other status string.
    Custom(String),
}

impl ReceiveStatus {
    /// The wire value of this status.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            ReceiveStatus::Ok => "ok",
            ReceiveStatus::Error => "error",
            ReceiveStatus::Custom(status) => status,
        }
    }
}

impl From<&str> for ReceiveStatus {
    fn from(status: &str) -> Self {
        match status {
            "ok" => ReceiveStatus::Ok,
            "error" => ReceiveStatus::Error,
            other => ReceiveStatus::Custom(other.to_string()),
        }
    }
}

/// Local reasons a push fails without a server reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushFailure {
    /// Send attempted while offline.
    #[error("Not connected to socket.")]
    NotConnected,

    /// The envelope could not be serialized.
    #[error("Invalid payload request.")]
    SerializeFailed,

    /// The socket disconnected before a reply arrived.
    #[error("Socket disconnected.")]
    Disconnected,

    /// Too many heartbeats went unanswered.
    #[error("Heartbeat timeout.")]
    HeartbeatTimeout,

    /// Rejected before sending.
    #[error("{0}")]
    Rejected(String),
}

impl PushFailure {
    /// The error payload delivered to `error` callbacks.
    #[must_use]
    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("reason".to_string(), Value::String(self.to_string()));
        payload
    }
}

/// The terminal result of a push.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Reply status; empty when the server sent none.
    pub status: String,
    /// Full reply payload.
    pub payload: Payload,
}

impl Reply {
    /// Whether the reply status is `ok`.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// The failure reason, if the payload carries one.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        beacon_protocol::envelope::error_reason(&self.payload)
    }
}

#[derive(Default)]
struct PushState {
    callbacks: Vec<(String, ReceiveCallback)>,
    always: Vec<AlwaysCallback>,
    reply: Option<Reply>,
}

struct PushInner {
    envelope: Envelope,
    created: Instant,
    state: Mutex<PushState>,
}

/// An outbound envelope awaiting its reply.
///
/// Cloning a push yields another handle to the same request.
#[derive(Clone)]
pub struct Push {
    inner: Arc<PushInner>,
}

impl std::fmt::Debug for Push {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Push")
            .field("topic", &self.inner.envelope.topic)
            .field("event", &self.inner.envelope.event)
            .field("ref", &self.inner.envelope.reference)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl Push {
    /// Create a push with a fresh ref.
    #[must_use]
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Payload) -> Self {
        Self::with_ref(topic, event, payload, generate_ref())
    }

    /// Create a push with an explicit ref.
    #[must_use]
    pub fn with_ref(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Payload,
        reference: impl Into<String>,
    ) -> Self {
        Self::from_envelope(Envelope::new(topic, event, payload).with_ref(reference))
    }

    /// Wrap an existing envelope.
    #[must_use]
    pub fn from_envelope(envelope: Envelope) -> Self {
        Self {
            inner: Arc::new(PushInner {
                envelope,
                created: Instant::now(),
                state: Mutex::new(PushState::default()),
            }),
        }
    }

    /// Create a heartbeat push.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::with_ref(
            PHOENIX_TOPIC,
            event::HEARTBEAT,
            Payload::new(),
            generate_heartbeat_ref(),
        )
    }

    /// The outbound envelope.
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.inner.envelope
    }

    /// The correlation ref.
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.inner.envelope.reference
    }

    /// The target topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.envelope.topic
    }

    /// The event name.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.inner.envelope.event
    }

    /// The outbound payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.inner.envelope.payload
    }

    /// Whether this push is a heartbeat.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.inner.envelope.event == event::HEARTBEAT
    }

    /// Time elapsed since the push was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.created.elapsed()
    }

    /// Whether the push has resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.inner.state.lock().reply.is_some()
    }

    /// The stored reply, once resolved.
    #[must_use]
    pub fn reply_snapshot(&self) -> Option<Reply> {
        self.inner.state.lock().reply.clone()
    }

    /// Whether two handles refer to the same push.
    #[must_use]
    pub fn ptr_eq(&self, other: &Push) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a callback for a reply status.
    ///
    /// Callbacks for the same status fire in registration order. If the push
    /// is already resolved with a matching status the callback fires
    /// immediately; with any other status it is discarded.
    pub fn receive<F>(&self, status: impl Into<ReceiveStatus>, callback: F) -> &Self
    where
        F: FnOnce(&Payload) + Send + 'static,
    {
        let status = status.into();
        let mut state = self.inner.state.lock();

        match &state.reply {
            Some(reply) => {
                if reply.status == status.as_str() {
                    let payload = reply.payload.clone();
                    drop(state);
                    callback(&payload);
                }
            }
            None => state
                .callbacks
                .push((status.as_str().to_string(), Box::new(callback))),
        }

        self
    }

    /// Register a callback fired once on any resolution.
    pub fn always<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();

        if state.reply.is_some() {
            drop(state);
            callback();
        } else {
            state.always.push(Box::new(callback));
        }

        self
    }

    /// Wait for the push to resolve.
    ///
    /// Resolves to `None` if every handle to the push is dropped before it
    /// resolves.
    pub fn reply(&self) -> impl Future<Output = Option<Reply>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let weak = Arc::downgrade(&self.inner);

        self.always(move || {
            let reply = weak.upgrade().and_then(|inner| inner.state.lock().reply.clone());
            if let Some(reply) = reply {
                let _ = tx.send(reply);
            }
        });

        async move { rx.await.ok() }
    }

    /// Resolve from a server reply.
    pub fn handle_response(&self, envelope: &Envelope) {
        let status = envelope.status().unwrap_or_default().to_string();
        self.resolve(Reply {
            status,
            payload: envelope.payload.clone(),
        });
    }

    /// Resolve as failed because the envelope could not be serialized.
    pub fn handle_parse_error(&self) {
        self.handle_failure(&PushFailure::SerializeFailed);
    }

    /// Resolve as failed because the socket is offline.
    pub fn handle_not_connected(&self) {
        self.handle_failure(&PushFailure::NotConnected);
    }

    /// Resolve as failed because the socket disconnected.
    pub fn handle_disconnected(&self) {
        self.handle_failure(&PushFailure::Disconnected);
    }

    /// Resolve as failed before sending.
    pub fn handle_rejected(&self, reason: impl Into<String>) {
        self.handle_failure(&PushFailure::Rejected(reason.into()));
    }

    /// Resolve with a local failure.
    pub fn handle_failure(&self, failure: &PushFailure) {
        self.resolve(Reply {
            status: ReceiveStatus::Error.as_str().to_string(),
            payload: failure.to_payload(),
        });
    }

    fn resolve(&self, reply: Reply) {
        let (callbacks, always) = {
            let mut state = self.inner.state.lock();
            if state.reply.is_some() {
                debug!(reference = %self.reference(), "Push already resolved, ignoring");
                return;
            }
            state.reply = Some(reply.clone());
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.always),
            )
        };

        for (status, callback) in callbacks {
            if status == reply.status {
                callback(&reply.payload);
            }
        }

        for callback in always {
            callback();
        }
    }
}
