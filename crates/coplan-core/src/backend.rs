//! Shared backend abstractions.
//!
//! Instances share two external dependencies: a presence store holding each
//! room's roster, and a pub/sub bus carrying room events between instances.
//! These traits let the router and fanout stay independent of whichever
//! backend (in-memory, Redis) is plugged in.

use async_trait::async_trait;
use coplan_protocol::{Channel, PresenceEntry, RoomId, ServerEvent};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached or refused the command.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// A value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Per-room roster shared by every instance.
///
/// The TTL applies to a room's whole collection and is refreshed on every
/// `join`. Writes are keyed by user id, so repeating one is harmless.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Upsert a member's entry and refresh the room's TTL.
    async fn join(&self, room: &str, user_id: &str, entry: &PresenceEntry)
        -> Result<(), BackendError>;

    /// Remove a member's entry.
    async fn leave(&self, room: &str, user_id: &str) -> Result<(), BackendError>;

    /// Current members of a room, unordered.
    async fn list(&self, room: &str) -> Result<Vec<PresenceEntry>, BackendError>;
}

/// Body of a message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    /// Room the event belongs to.
    pub room_id: RoomId,
    /// The event to deliver to the room's local members.
    pub data: ServerEvent,
    /// User id of the sender. Members joined as this user are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl BusMessage {
    /// Create a bus message.
    #[must_use]
    pub fn new(room_id: impl Into<RoomId>, data: ServerEvent, origin: Option<String>) -> Self {
        Self {
            room_id: room_id.into(),
            data,
            origin,
        }
    }
}

/// Stream of messages delivered by a bus subscription.
pub type BusStream = BoxStream<'static, (Channel, BusMessage)>;

/// Pub/sub bus shared by every instance.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a message on a channel.
    async fn publish(&self, channel: Channel, message: &BusMessage) -> Result<(), BackendError>;

    /// Subscribe to a set of channels.
    ///
    /// The stream ends only when the bus itself is dropped.
    async fn subscribe(&self, channels: &[Channel]) -> Result<BusStream, BackendError>;

    /// Bus name for logging (e.g., "memory", "redis").
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bus_message_wire_shape() {
        let message = BusMessage::new("S1", ServerEvent::error("x"), Some("u1".into()));
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({ "roomId": "S1", "data": { "type": "error", "error": "x" }, "origin": "u1" })
        );

        let without_origin: BusMessage = serde_json::from_value(json!({
            "roomId": "S2",
            "data": { "type": "presence-update", "action": "leave", "roomId": "S2", "users": [] }
        }))
        .unwrap();
        assert_eq!(without_origin.room_id, "S2");
        assert!(without_origin.origin.is_none());
    }
}
