//! In-memory transport for socket and channel tests.

use async_trait::async_trait;
use beacon_protocol::{codec, Envelope, Payload};
use beacon_transport::{EventSender, Transport, TransportError, TransportEvent};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub(crate) struct MockTransport {
    auto_connect: bool,
    connected: AtomicBool,
    events: Mutex<Option<EventSender>>,
    written: Mutex<Vec<String>>,
    pub(crate) connect_calls: AtomicUsize,
    pub(crate) disconnect_calls: AtomicUsize,
}

impl MockTransport {
    /// Connects as soon as asked.
    pub(crate) fn new() -> Self {
        Self {
            auto_connect: true,
            connected: AtomicBool::new(false),
            events: Mutex::new(None),
            written: Mutex::new(Vec::new()),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
        }
    }

    /// Never finishes connecting.
    pub(crate) fn stalled() -> Self {
        Self {
            auto_connect: false,
            ..Self::new()
        }
    }

    pub(crate) fn push_message(&self, text: impl Into<String>) {
        self.emit(TransportEvent::Message(text.into()));
    }

    /// Simulate the peer dropping the connection.
    pub(crate) fn drop_connection(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(TransportEvent::Disconnected(Some(
                TransportError::ReceiveFailure {
                    reason: "connection reset".into(),
                    code: 54,
                },
            )));
        }
    }

    pub(crate) fn written(&self) -> Vec<String> {
        self.written.lock().clone()
    }

    pub(crate) fn written_envelopes(&self) -> Vec<Envelope> {
        self.written
            .lock()
            .iter()
            .map(|text| codec::decode(text).unwrap())
            .collect()
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn connect(&self, events: EventSender) {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        *self.events.lock() = Some(events);
        if self.auto_connect {
            self.connected.store(true, Ordering::SeqCst);
            self.emit(TransportEvent::Connected);
        }
    }

    fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(TransportEvent::Disconnected(Some(
                TransportError::Disconnection {
                    reason: "Disconnected by client".into(),
                    code: 1000,
                },
            )));
        }
    }

    async fn write(&self, data: Bytes) -> Result<(), TransportError> {
        let text = String::from_utf8(data.to_vec())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.written.lock().push(text);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn url(&self) -> &str {
        "mock://socket"
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Build a payload from a JSON object literal.
pub(crate) fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// Yield to spawned tasks until `condition` holds.
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
