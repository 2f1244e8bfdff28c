//! Typed decoding of push replies.

use crate::push::{Push, ReceiveStatus};
use beacon_protocol::envelope::error_reason;
use beacon_protocol::Payload;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;

/// Default reason when a join is rejected without one.
pub const JOIN_REJECTED: &str = "Join not accepted";

/// Default reason when a send is rejected without one.
pub const SEND_REJECTED: &str = "Command not accepted";

/// Errors delivered to typed completions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    /// The server answered with `error`, or the push failed locally.
    #[error("{context}: {reason}")]
    Rejected {
        /// Socket and operation, e.g. `[Lobby] Join Error`.
        context: String,
        /// Server or local failure reason.
        reason: String,
    },

    /// The reply carried no `response` object.
    #[error("{context}: Invalid response payload")]
    InvalidResponse {
        /// Socket and operation.
        context: String,
    },

    /// The `response` did not match the expected type.
    #[error("{context}: Decode error: {message}")]
    Decode {
        /// Socket and operation.
        context: String,
        /// Deserializer message.
        message: String,
    },
}

impl ReplyError {
    /// The failure reason for rejections.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            ReplyError::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Decode the `response` member of a reply payload.
pub fn decode_response<T: DeserializeOwned>(
    payload: &Payload,
    context: &str,
) -> Result<T, ReplyError> {
    let response = payload
        .get("response")
        .filter(|value| !value.is_null())
        .ok_or_else(|| ReplyError::InvalidResponse {
            context: context.to_string(),
        })?;

    serde_json::from_value(response.clone()).map_err(|e| ReplyError::Decode {
        context: context.to_string(),
        message: e.to_string(),
    })
}

/// Build a rejection from an error payload.
#[must_use]
pub fn rejection(payload: &Payload, context: &str, default_reason: &str) -> ReplyError {
    ReplyError::Rejected {
        context: context.to_string(),
        reason: error_reason(payload).unwrap_or(default_reason).to_string(),
    }
}

/// Deliver the reply of `push` to `completion` exactly once.
pub(crate) fn attach_typed<T, F>(
    push: &Push,
    context: String,
    default_reason: &'static str,
    completion: F,
)
where
    T: DeserializeOwned + 'static,
    F: FnOnce(Result<T, ReplyError>) + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(completion)));
    let context = Arc::new(context);

    let ok_slot = Arc::clone(&slot);
    let ok_context = Arc::clone(&context);
    push.receive(ReceiveStatus::Ok, move |payload| {
        if let Some(completion) = ok_slot.lock().take() {
            completion(decode_response(payload, &ok_context));
        }
    });

    let error_slot = Arc::clone(&slot);
    let error_context = Arc::clone(&context);
    push.receive(ReceiveStatus::Error, move |payload| {
        if let Some(completion) = error_slot.lock().take() {
            completion(Err(rejection(payload, &error_context, default_reason)));
        }
    });

    // Any other status still completes.
    push.always(move || {
        let pending = slot.lock().take();
        if let Some(completion) = pending {
            completion(Err(ReplyError::Rejected {
                context: context.to_string(),
                reason: "Unexpected reply status".to_string(),
            }));
        }
    });
}

/// `[name] Join Error`
#[must_use]
pub fn join_context(socket_name: &str) -> String {
    format!("[{socket_name}] Join Error")
}

/// `[name] Send - event Error`
#[must_use]
pub fn send_context(socket_name: &str, event: &str) -> String {
    format!("[{socket_name}] Send - {event} Error")
}
