//! Codec for encoding and decoding envelopes.
//!
//! Envelopes travel as JSON text frames. Decoding never panics: every
//! malformed frame becomes a [`ProtocolError`] the caller can report and drop.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::{Envelope, RawEnvelope};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// The frame is not valid JSON or does not have the envelope shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame parsed but violates an envelope invariant.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(&'static str),
}

/// Encode an envelope to a JSON frame.
///
/// All four fields are always emitted; an absent ref is written as `""`.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    encode_with_limit(envelope, MAX_FRAME_SIZE)
}

/// Encode an envelope, enforcing a custom frame size limit.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode_with_limit(envelope: &Envelope, max: usize) -> Result<Bytes, ProtocolError> {
    let data = serde_json::to_vec(envelope)?;

    if data.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max,
        });
    }

    Ok(Bytes::from(data))
}

/// Decode an envelope from a text frame.
///
/// # Errors
///
/// Returns an error if the text is not a JSON object with non-empty string
/// `topic` and `event` fields and an object `payload`.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    decode_with_limit(text, MAX_FRAME_SIZE)
}

/// Decode an envelope, enforcing a custom frame size limit.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_with_limit(text: &str, max: usize) -> Result<Envelope, ProtocolError> {
    if text.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max,
        });
    }

    let raw: RawEnvelope = serde_json::from_str(text)?;
    Envelope::try_from(raw).map_err(ProtocolError::InvalidEnvelope)
}

/// Codec carrying a frame size limit.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    max_frame_size: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl EnvelopeCodec {
    /// Create a codec with the given frame size limit.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// The configured frame size limit.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, ProtocolError> {
        encode_with_limit(envelope, self.max_frame_size)
    }

    /// Decode an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode(&self, text: &str) -> Result<Envelope, ProtocolError> {
        decode_with_limit(text, self.max_frame_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use serde_json::{json, Value};

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let envelope = Envelope::new("room:lobby", "new_msg", payload(json!({"body": "hi"})))
            .with_ref("42");

        let encoded = encode(&envelope).unwrap();
        let decoded = decode(std::str::from_utf8(&encoded).unwrap()).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn test_absent_ref_roundtrips_empty() {
        let envelope = Envelope::new("room:lobby", "typing", Payload::new());
        let encoded = encode(&envelope).unwrap();

        let value: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["ref"], json!(""));

        let decoded = decode(std::str::from_utf8(&encoded).unwrap()).unwrap();
        assert_eq!(decoded.reference, "");
        assert!(!decoded.has_ref());
    }

    #[test]
    fn test_decode_missing_or_null_ref() {
        let decoded = decode(r#"{"topic":"t","event":"e","payload":{}}"#).unwrap();
        assert_eq!(decoded.reference, "");

        let decoded = decode(r#"{"topic":"t","event":"e","payload":{},"ref":null}"#).unwrap();
        assert_eq!(decoded.reference, "");
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let decoded =
            decode(r#"{"topic":"t","event":"e","payload":{},"ref":"1","join_ref":"9"}"#).unwrap();
        assert_eq!(decoded.reference, "1");
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let cases = [
            "not json",
            "[1,2,3]",
            r#""just a string""#,
            r#"{"event":"e","payload":{}}"#,
            r#"{"topic":"t","payload":{}}"#,
            r#"{"topic":"t","event":"e"}"#,
            r#"{"topic":"t","event":"e","payload":[1]}"#,
            r#"{"topic":"t","event":"e","payload":"x"}"#,
            r#"{"topic":1,"event":"e","payload":{}}"#,
        ];

        for case in cases {
            assert!(
                matches!(decode(case), Err(ProtocolError::Json(_))),
                "expected JSON error for {case}"
            );
        }
    }

    #[test]
    fn test_decode_rejects_empty_names() {
        match decode(r#"{"topic":"","event":"e","payload":{}}"#) {
            Err(ProtocolError::InvalidEnvelope(_)) => {}
            other => panic!("Expected InvalidEnvelope error, got {:?}", other),
        }
        match decode(r#"{"topic":"t","event":"","payload":{}}"#) {
            Err(ProtocolError::InvalidEnvelope(_)) => {}
            other => panic!("Expected InvalidEnvelope error, got {:?}", other),
        }
    }

    #[test]
    fn test_payload_key_order_preserved() {
        let text = r#"{"topic":"t","event":"e","payload":{"z":1,"a":2,"m":3},"ref":""}"#;
        let decoded = decode(text).unwrap();
        let keys: Vec<&str> = decoded.payload.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);

        let encoded = encode(&decoded).unwrap();
        assert_eq!(std::str::from_utf8(&encoded).unwrap(), text);
    }

    #[test]
    fn test_frame_too_large() {
        let codec = EnvelopeCodec::new(64);
        let envelope = Envelope::new("t", "e", payload(json!({"body": "x".repeat(100)})));

        match codec.encode(&envelope) {
            Err(ProtocolError::FrameTooLarge { max, .. }) => assert_eq!(max, 64),
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }

        let text = format!(r#"{{"topic":"t","event":"e","payload":{{"b":"{}"}}}}"#, "x".repeat(100));
        assert!(matches!(
            codec.decode(&text),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
