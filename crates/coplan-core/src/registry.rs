//! Local room registry.
//!
//! Maps each room to the connections joined to it on *this* instance. A
//! connection is a member of at most one room at a time: joining a room
//! first evicts it from the previous one. Rooms are created on first join
//! and deleted when their last member leaves.

use crate::connection::{Connection, ConnectionId};
use coplan_protocol::RoomId;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Maximum room id length in bytes.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// Validate a room id.
///
/// # Errors
///
/// Returns an error message if the room id is invalid.
pub fn validate_room_id(room: &str) -> Result<(), &'static str> {
    if room.is_empty() {
        return Err("Room id cannot be empty");
    }
    if room.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if room.chars().any(char::is_control) {
        return Err("Room id contains invalid characters");
    }
    Ok(())
}

/// Registry of locally-held room members.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    /// Rooms indexed by id.
    rooms: DashMap<RoomId, HashMap<ConnectionId, Arc<Connection>>>,
    /// Connection memberships (connection id -> room id).
    memberships: DashMap<ConnectionId, RoomId>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, evicting it from any prior room.
    ///
    /// Returns the room the connection was evicted from, if it differs from
    /// the new one.
    pub fn join(&self, connection: &Arc<Connection>, room: &str) -> Option<RoomId> {
        let id = connection.id().clone();
        let previous = self.memberships.insert(id.clone(), room.to_string());

        let evicted = match previous {
            Some(prev) if prev != room => {
                self.remove_member(&prev, &id);
                Some(prev)
            }
            _ => None,
        };

        let members = {
            let mut entry = self.rooms.entry(room.to_string()).or_insert_with(|| {
                debug!(room = %room, "Creating room");
                HashMap::new()
            });
            entry.insert(id.clone(), Arc::clone(connection));
            entry.len()
        };

        debug!(room = %room, connection = %id, members, "Joined room");
        evicted
    }

    /// Remove a connection from its room.
    ///
    /// Returns the room it was in, if any.
    pub fn leave(&self, connection_id: &ConnectionId) -> Option<RoomId> {
        let (_, room) = self.memberships.remove(connection_id)?;
        self.remove_member(&room, connection_id);
        debug!(room = %room, connection = %connection_id, "Left room");
        Some(room)
    }

    /// Local members of a room.
    #[must_use]
    pub fn members(&self, room: &str) -> Vec<Arc<Connection>> {
        self.rooms
            .get(room)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Room a connection is in, if any.
    #[must_use]
    pub fn room_of(&self, connection_id: &ConnectionId) -> Option<RoomId> {
        self.memberships.get(connection_id).map(|r| r.value().clone())
    }

    /// Whether a room holds a connection.
    #[must_use]
    pub fn contains(&self, room: &str, connection_id: &ConnectionId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|m| m.contains_key(connection_id))
    }

    /// Check if a room exists locally.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            room_count: self.rooms.len(),
            member_count: self.memberships.len(),
        }
    }

    fn remove_member(&self, room: &str, connection_id: &ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(connection_id);
        }
        if self.rooms.remove_if(room, |_, m| m.is_empty()).is_some() {
            debug!(room = %room, "Deleted empty room");
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of rooms with local members.
    pub room_count: usize,
    /// Number of connections in a room.
    pub member_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Identity;

    fn connection() -> Arc<Connection> {
        Connection::channel(Identity::new("u1", "Ada", "student")).0
    }

    #[test]
    fn test_join_leave() {
        let registry = RoomRegistry::new();
        let conn = connection();

        assert!(registry.join(&conn, "S1").is_none());
        assert!(registry.room_exists("S1"));
        assert!(registry.contains("S1", conn.id()));
        assert_eq!(registry.room_of(conn.id()).as_deref(), Some("S1"));

        assert_eq!(registry.leave(conn.id()).as_deref(), Some("S1"));
        // Room should be auto-deleted
        assert!(!registry.room_exists("S1"));
        assert!(registry.leave(conn.id()).is_none());
    }

    #[test]
    fn test_rejoin_moves_connection() {
        let registry = RoomRegistry::new();
        let conn = connection();
        let other = connection();

        registry.join(&conn, "S1");
        registry.join(&other, "S1");

        assert_eq!(registry.join(&conn, "S2").as_deref(), Some("S1"));
        assert!(!registry.contains("S1", conn.id()));
        assert!(registry.contains("S2", conn.id()));
        assert_eq!(registry.members("S1").len(), 1);

        // Same room again is not an eviction
        assert!(registry.join(&conn, "S2").is_none());
        assert_eq!(registry.members("S2").len(), 1);
    }

    #[test]
    fn test_always_exactly_one_room() {
        let registry = RoomRegistry::new();
        let conn = connection();
        let rooms = ["S1", "S2", "S2", "S3", "S1", "S4", "S3"];

        for room in rooms {
            registry.join(&conn, room);
            let holding: Vec<&str> = ["S1", "S2", "S3", "S4"]
                .into_iter()
                .filter(|r| registry.contains(r, conn.id()))
                .collect();
            assert_eq!(holding, vec![room]);
        }
        assert_eq!(registry.stats().room_count, 1);
    }

    #[test]
    fn test_room_id_validation() {
        assert!(validate_room_id("S1").is_ok());
        assert!(validate_room_id("42").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("bad\nroom").is_err());

        let long_room = "a".repeat(MAX_ROOM_ID_LENGTH + 1);
        assert!(validate_room_id(&long_room).is_err());
    }

    #[test]
    fn test_stats() {
        let registry = RoomRegistry::new();
        let (a, b, c) = (connection(), connection(), connection());

        registry.join(&a, "S1");
        registry.join(&b, "S1");
        registry.join(&c, "S2");

        let stats = registry.stats();
        assert_eq!(stats.room_count, 2);
        assert_eq!(stats.member_count, 3);
    }
}
