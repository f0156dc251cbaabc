//! # coplan-protocol
//!
//! Wire protocol definitions for the coplan collaboration layer.
//!
//! Clients and servers exchange JSON objects in WebSocket text frames. Each
//! object carries a `type` discriminator:
//!
//! - `join-student-room` / `leave-room` - Room membership
//! - `chat-message`, `plans-update`, `comments-update` - Relayed room events
//! - `presence-update` - Full room roster
//! - `room-joined`, `error`, `info` - Sender-only replies
//!
//! ## Example
//!
//! ```rust
//! use coplan_protocol::{codec, ClientEvent, Decoded};
//!
//! let text = codec::encode_client(&ClientEvent::chat("hello", "Student")).unwrap();
//! let decoded = codec::decode(&text).unwrap();
//! assert!(matches!(decoded, Decoded::Event(ClientEvent::ChatMessage(_))));
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, Decoded, ProtocolError};
pub use envelope::{
    Channel, ChatMessage, ClientEvent, CommentsUpdate, JoinRoom, PlansUpdate, PresenceAction,
    PresenceEntry, RoomId, RoomJoined, ServerEvent,
};
