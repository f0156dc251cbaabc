//! Envelope types for the coplan wire protocol.
//!
//! Every frame is a JSON object whose `type` field names the event. Inbound
//! frames decode into [`ClientEvent`], outbound frames are built from
//! [`ServerEvent`]. Relay payloads (plans, comments) are carried as opaque
//! JSON values and are never inspected.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A room key. Rooms are keyed by student id.
pub type RoomId = String;

/// Pub/sub channels. Each channel is named exactly after the event type it
/// carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    ChatMessage,
    PlansUpdate,
    CommentsUpdate,
    PresenceUpdate,
}

impl Channel {
    /// The fixed channel set every instance subscribes to.
    pub const ALL: [Channel; 4] = [
        Channel::ChatMessage,
        Channel::PlansUpdate,
        Channel::CommentsUpdate,
        Channel::PresenceUpdate,
    ];

    /// Get the channel name as used on the bus.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::ChatMessage => "chat-message",
            Channel::PlansUpdate => "plans-update",
            Channel::CommentsUpdate => "comments-update",
            Channel::PresenceUpdate => "presence-update",
        }
    }

    /// Look up a channel by its bus name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presence action carried by a `presence-update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    /// A member joined the room.
    Join,
    /// A member left the room.
    Leave,
    /// Full roster resync.
    Sync,
}

/// A single member of a room roster, as held by the presence store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    /// Room the member joined.
    pub room_id: RoomId,
    /// Member's user id.
    pub user_id: String,
    /// Display name resolved from the user directory.
    pub name: String,
    /// Display role (student, counselor, ...).
    pub role: String,
    /// Join time in milliseconds since the Unix epoch.
    pub joined_at: u64,
}

/// Payload of a `join-student-room` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    /// Room to join. Numeric ids are accepted and kept as text.
    #[serde(deserialize_with = "id::text")]
    pub student_id: RoomId,
    /// User id to join as. Defaults to the authenticated user.
    #[serde(
        default,
        deserialize_with = "id::optional_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    /// Display role to join as. Defaults to the authenticated role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<String>,
}

/// Ids issued by the CRUD side are numbers or strings depending on the
/// client; both decode to text.
mod id {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    impl From<Id> for String {
        fn from(id: Id) -> Self {
            match id {
                Id::Text(s) => s,
                Id::Signed(n) => n.to_string(),
                Id::Unsigned(n) => n.to_string(),
            }
        }
    }

    pub(super) fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Id::deserialize(deserializer).map(String::from)
    }

    pub(super) fn optional_text<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        Ok(Option::<Id>::deserialize(deserializer)?.map(String::from))
    }
}

/// Payload of a `room-joined` acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    pub student_id: RoomId,
    pub user_type: String,
    pub user_id: String,
}

/// A chat line. Relayed verbatim, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message text.
    pub message: String,
    /// Sender label chosen by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Client timestamp, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

/// A full plan set broadcast after a successful save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlansUpdate {
    pub plans: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

/// A full comment list broadcast after a successful save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentsUpdate {
    pub comments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Join (or switch to) a student's room.
    #[serde(rename = "join-student-room")]
    JoinStudentRoom {
        /// Join parameters.
        data: JoinRoom,
    },

    /// Chat line for the current room.
    #[serde(rename = "chat-message")]
    ChatMessage(ChatMessage),

    /// Plan set for the current room.
    #[serde(rename = "plans-update")]
    PlansUpdate(PlansUpdate),

    /// Comment list for the current room.
    #[serde(rename = "comments-update")]
    CommentsUpdate(CommentsUpdate),

    /// Leave the current room, keeping the connection open.
    #[serde(rename = "leave-room")]
    LeaveRoom,
}

impl ClientEvent {
    /// Type tags this enum decodes.
    pub const TYPES: [&'static str; 5] = [
        "join-student-room",
        "chat-message",
        "plans-update",
        "comments-update",
        "leave-room",
    ];

    /// Get the wire type tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::JoinStudentRoom { .. } => "join-student-room",
            ClientEvent::ChatMessage(_) => "chat-message",
            ClientEvent::PlansUpdate(_) => "plans-update",
            ClientEvent::CommentsUpdate(_) => "comments-update",
            ClientEvent::LeaveRoom => "leave-room",
        }
    }

    /// Create a join request with explicit user id and role.
    #[must_use]
    pub fn join(
        student_id: impl Into<RoomId>,
        user_id: impl Into<String>,
        user_type: impl Into<String>,
    ) -> Self {
        ClientEvent::JoinStudentRoom {
            data: JoinRoom {
                student_id: student_id.into(),
                user_id: Some(user_id.into()),
                user_type: Some(user_type.into()),
            },
        }
    }

    /// Create a chat line.
    #[must_use]
    pub fn chat(message: impl Into<String>, sender: impl Into<String>) -> Self {
        ClientEvent::ChatMessage(ChatMessage {
            message: message.into(),
            sender: Some(sender.into()),
            timestamp: None,
        })
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Acknowledges a join to the joining connection only.
    #[serde(rename = "room-joined")]
    RoomJoined {
        /// Joined room and identity.
        data: RoomJoined,
    },

    /// Relayed chat line.
    #[serde(rename = "chat-message")]
    ChatMessage(ChatMessage),

    /// Relayed plan set.
    #[serde(rename = "plans-update")]
    PlansUpdate(PlansUpdate),

    /// Relayed comment list.
    #[serde(rename = "comments-update")]
    CommentsUpdate(CommentsUpdate),

    /// Full roster of a room.
    #[serde(rename = "presence-update", rename_all = "camelCase")]
    PresenceUpdate {
        /// What triggered the update.
        action: PresenceAction,
        /// Room the roster belongs to.
        room_id: RoomId,
        /// Every current member, unordered.
        users: Vec<PresenceEntry>,
    },

    /// Sender-only error. The connection stays open.
    #[serde(rename = "error")]
    Error {
        /// Human-readable reason.
        error: String,
    },

    /// Sender-only informational notice.
    #[serde(rename = "info")]
    Info {
        /// Human-readable notice.
        message: String,
    },
}

impl ServerEvent {
    /// Create an error envelope.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        ServerEvent::Error {
            error: reason.into(),
        }
    }

    /// Create an informational envelope.
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        ServerEvent::Info {
            message: message.into(),
        }
    }

    /// Create a roster update.
    #[must_use]
    pub fn presence(
        action: PresenceAction,
        room_id: impl Into<RoomId>,
        users: Vec<PresenceEntry>,
    ) -> Self {
        ServerEvent::PresenceUpdate {
            action,
            room_id: room_id.into(),
            users,
        }
    }

    /// The bus channel this event travels on, if it is broadcast at all.
    #[must_use]
    pub fn channel(&self) -> Option<Channel> {
        match self {
            ServerEvent::ChatMessage(_) => Some(Channel::ChatMessage),
            ServerEvent::PlansUpdate(_) => Some(Channel::PlansUpdate),
            ServerEvent::CommentsUpdate(_) => Some(Channel::CommentsUpdate),
            ServerEvent::PresenceUpdate { .. } => Some(Channel::PresenceUpdate),
            ServerEvent::RoomJoined { .. } | ServerEvent::Error { .. } | ServerEvent::Info { .. } => {
                None
            }
        }
    }
}
