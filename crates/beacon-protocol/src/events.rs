//! Reserved topics, events and keys of the channels protocol.

/// Topic dedicated to heartbeat correlation.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Prefix carried by every heartbeat ref.
pub const HEARTBEAT_REF_PREFIX: &str = "hb-";

/// Meta key holding the per-session token used when matching presence leaves.
pub const PRESENCE_REF_KEY: &str = "phx_ref";

/// Event names reserved by the protocol.
pub mod event {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const ERROR: &str = "phx_error";
    pub const CLOSE: &str = "phx_close";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
}

/// Check whether a ref belongs to a heartbeat.
#[must_use]
pub fn is_heartbeat_ref(reference: &str) -> bool {
    reference.starts_with(HEARTBEAT_REF_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_ref() {
        assert!(is_heartbeat_ref("hb-1234"));
        assert!(!is_heartbeat_ref("1234-hb-"));
    }
}
