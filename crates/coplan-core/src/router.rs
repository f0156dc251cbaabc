//! Per-message routing.
//!
//! The router applies each decoded client event on behalf of its connection:
//! room membership changes touch the local registry and the shared presence
//! store, and room events are handed to the fanout for publishing. Replies
//! that only concern the sender are queued on the connection directly.

use crate::backend::PresenceStore;
use crate::clock::Clock;
use crate::collaborators::UserDirectory;
use crate::connection::{Connection, Membership};
use crate::fanout::Fanout;
use crate::registry::{validate_room_id, RoomRegistry};
use coplan_protocol::{
    ClientEvent, JoinRoom, PresenceAction, PresenceEntry, RoomId, RoomJoined, ServerEvent,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Display name used when the directory has none.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Router errors. Each is reported to the sender only.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A room event was sent before joining a room.
    #[error("Join a student room first")]
    NotInRoom,

    /// The requested room id is not acceptable.
    #[error("Invalid room: {0}")]
    InvalidRoom(&'static str),
}

/// Applies client events.
pub struct MessageRouter {
    registry: Arc<RoomRegistry>,
    presence: Arc<dyn PresenceStore>,
    directory: Arc<dyn UserDirectory>,
    fanout: Arc<Fanout>,
    clock: Arc<dyn Clock>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(
        registry: Arc<RoomRegistry>,
        presence: Arc<dyn PresenceStore>,
        directory: Arc<dyn UserDirectory>,
        fanout: Arc<Fanout>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            presence,
            directory,
            fanout,
            clock,
        }
    }

    /// Apply one event for a connection.
    ///
    /// # Errors
    ///
    /// Returns an error the caller should report to the sender.
    pub async fn dispatch(
        &self,
        connection: &Arc<Connection>,
        event: ClientEvent,
    ) -> Result<(), RouterError> {
        match event {
            ClientEvent::JoinStudentRoom { data } => self.join_room(connection, data).await,
            ClientEvent::ChatMessage(chat) => {
                self.relay(connection, ServerEvent::ChatMessage(chat)).await
            }
            ClientEvent::PlansUpdate(plans) => {
                self.relay(connection, ServerEvent::PlansUpdate(plans)).await
            }
            ClientEvent::CommentsUpdate(comments) => {
                self.relay(connection, ServerEvent::CommentsUpdate(comments))
                    .await
            }
            ClientEvent::LeaveRoom => {
                self.leave_room(connection).await;
                Ok(())
            }
        }
    }

    /// Join a room, leaving the previous one first.
    ///
    /// Presence failures are logged; the join itself always completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the room id is invalid.
    pub async fn join_room(
        &self,
        connection: &Arc<Connection>,
        request: JoinRoom,
    ) -> Result<(), RouterError> {
        validate_room_id(&request.student_id).map_err(RouterError::InvalidRoom)?;

        let identity = connection.identity();
        let room = request.student_id;
        let user_id = request.user_id.unwrap_or_else(|| identity.id.clone());
        let user_type = request.user_type.unwrap_or_else(|| identity.role.clone());

        // Resolved before any membership change so a failing lookup leaves
        // the connection where it was.
        let name = self.resolve_name(&user_id).await;

        let previous = connection.set_membership(Some(Membership {
            room_id: room.clone(),
            user_id: user_id.clone(),
            user_type: user_type.clone(),
        }));
        self.registry.join(connection, &room);

        if let Some(prev) = previous.filter(|p| p.room_id != room || p.user_id != user_id) {
            debug!(connection = %connection.id(), from = %prev.room_id, to = %room, "Switching rooms");
            self.remove_presence(&prev.room_id, &prev.user_id).await;
        }

        let entry = PresenceEntry {
            room_id: room.clone(),
            user_id: user_id.clone(),
            name,
            role: user_type.clone(),
            joined_at: self.clock.unix_millis(),
        };

        if let Err(e) = self.presence.join(&room, &user_id, &entry).await {
            warn!(room = %room, user = %user_id, error = %e, "Presence join failed");
        }
        self.publish_roster(&room, PresenceAction::Join).await;

        connection.send(&ServerEvent::RoomJoined {
            data: RoomJoined {
                student_id: room.clone(),
                user_type,
                user_id,
            },
        });

        debug!(connection = %connection.id(), room = %room, "Joined student room");
        Ok(())
    }

    /// Publish a room event on behalf of a connection.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NotInRoom`] if the connection has not joined.
    pub async fn relay(
        &self,
        connection: &Arc<Connection>,
        event: ServerEvent,
    ) -> Result<(), RouterError> {
        let membership = connection.membership().ok_or(RouterError::NotInRoom)?;
        self.fanout
            .publish(&membership.room_id, event, Some(membership.user_id))
            .await;
        Ok(())
    }

    /// Leave the current room, if any.
    ///
    /// Removes the connection from the local registry and its user from the
    /// presence store, then publishes the remaining roster. Returns the room
    /// that was left.
    pub async fn leave_room(&self, connection: &Arc<Connection>) -> Option<RoomId> {
        let membership = connection.set_membership(None);
        self.registry.leave(connection.id());

        let membership = membership?;
        self.remove_presence(&membership.room_id, &membership.user_id)
            .await;
        debug!(connection = %connection.id(), room = %membership.room_id, "Left student room");
        Some(membership.room_id)
    }

    /// Drop a user's presence entry unless another local connection is
    /// still in the room as that user. The caller must already have moved
    /// the departing connection out of `room`.
    async fn remove_presence(&self, room: &str, user_id: &str) {
        if self.held_locally(room, user_id) {
            debug!(room = %room, user = %user_id, "User still connected, presence kept");
        } else if let Err(e) = self.presence.leave(room, user_id).await {
            warn!(room = %room, user = %user_id, error = %e, "Presence leave failed");
        }
        self.publish_roster(room, PresenceAction::Leave).await;
    }

    fn held_locally(&self, room: &str, user_id: &str) -> bool {
        self.registry.members(room).iter().any(|c| {
            c.is_open()
                && c.membership()
                    .is_some_and(|m| m.room_id == room && m.user_id == user_id)
        })
    }

    async fn publish_roster(&self, room: &str, action: PresenceAction) {
        match self.presence.list(room).await {
            Ok(users) => {
                self.fanout
                    .publish(room, ServerEvent::presence(action, room, users), None)
                    .await;
            }
            Err(e) => {
                warn!(room = %room, error = %e, "Presence list failed, roster not published");
            }
        }
    }

    async fn resolve_name(&self, user_id: &str) -> String {
        match self.directory.lookup_name(user_id).await {
            Ok(Some(name)) => name,
            Ok(None) => UNKNOWN_NAME.to_string(),
            Err(e) => {
                warn!(user = %user_id, error = %e, "User directory lookup failed");
                UNKNOWN_NAME.to_string()
            }
        }
    }
}
