//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon channels client.
//!
//! A single socket multiplexes many topics. Every frame is a JSON envelope
//! tagged with a topic, an event name and an optional correlation ref.
//!
//! ## Reserved names
//!
//! - `phoenix` - Heartbeat topic
//! - `phx_join` / `phx_leave` - Channel membership
//! - `phx_reply` - Acknowledgments (`status` ok/error)
//! - `presence_state` / `presence_diff` - Presence synchronization
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, Envelope, Payload};
//!
//! let envelope = Envelope::new("room:lobby", "new_msg", Payload::new()).with_ref("1");
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(std::str::from_utf8(&encoded).unwrap()).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod events;

pub use codec::{decode, encode, EnvelopeCodec, ProtocolError, MAX_FRAME_SIZE};
pub use envelope::{Envelope, Payload};
pub use events::{HEARTBEAT_REF_PREFIX, PHOENIX_TOPIC, PRESENCE_REF_KEY};
