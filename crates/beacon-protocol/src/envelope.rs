//! The envelope exchanged over the wire.
//!
//! Every frame is a JSON object `{topic, event, payload, ref}`. The payload is
//! always an object; its key order is preserved.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope payload: an ordered map of opaque JSON values.
pub type Payload = Map<String, Value>;

/// A protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    /// Channel topic.
    pub topic: String,
    /// Event name within the topic.
    pub event: String,
    /// Event payload.
    pub payload: Payload,
    /// Correlation ref. Empty when absent.
    #[serde(rename = "ref")]
    pub reference: String,
}

/// Shape accepted on decode, before validation.
#[derive(Debug, Deserialize)]
pub(crate) struct RawEnvelope {
    pub(crate) topic: String,
    pub(crate) event: String,
    pub(crate) payload: Payload,
    #[serde(rename = "ref", default)]
    pub(crate) reference: Option<String>,
}

impl Envelope {
    /// Create an envelope without a ref.
    #[must_use]
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: String::new(),
        }
    }

    /// Attach a correlation ref.
    #[must_use]
    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = reference.into();
        self
    }

    /// Whether the envelope carries a ref.
    #[must_use]
    pub fn has_ref(&self) -> bool {
        !self.reference.is_empty()
    }

    /// The `status` of an ack payload, if present.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        status(&self.payload)
    }

    /// The nested `response` of an ack payload, if present.
    #[must_use]
    pub fn response(&self) -> Option<&Value> {
        self.payload.get("response")
    }

    /// The failure `reason` of an ack payload, if present.
    #[must_use]
    pub fn error_reason(&self) -> Option<&str> {
        error_reason(&self.payload)
    }
}

/// Extract the `status` string of an ack payload.
#[must_use]
pub fn status(payload: &Payload) -> Option<&str> {
    payload.get("status").and_then(Value::as_str)
}

/// Extract the failure `reason` of an ack payload.
///
/// Looks at `payload.reason` first, then `payload.response.reason`.
#[must_use]
pub fn error_reason(payload: &Payload) -> Option<&str> {
    payload.get("reason").and_then(Value::as_str).or_else(|| {
        payload
            .get("response")
            .and_then(|r| r.get("reason"))
            .and_then(Value::as_str)
    })
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = &'static str;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        if raw.topic.is_empty() {
            return Err("topic must not be empty");
        }
        if raw.event.is_empty() {
            return Err("event must not be empty");
        }

        Ok(Self {
            topic: raw.topic,
            event: raw.event,
            payload: raw.payload,
            reference: raw.reference.unwrap_or_default(),
        })
    }
}
