//! In-memory presence store.
//!
//! Rosters are kept per room with a TTL on the whole room collection, the
//! same shape the shared store uses. Expiry is checked lazily on access
//! against the injected [`Clock`].

use crate::backend::{BackendError, PresenceStore};
use crate::clock::Clock;
use async_trait::async_trait;
use coplan_protocol::{PresenceEntry, RoomId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default roster TTL (one hour).
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(3600);

/// Roster of a single room.
#[derive(Debug)]
struct RoomPresence {
    /// Map of user ID to entry.
    members: HashMap<String, PresenceEntry>,
    /// When the whole collection expires.
    expires_at: Instant,
}

impl RoomPresence {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Presence store for single-instance mode and tests.
#[derive(Debug)]
pub struct MemoryPresenceStore {
    rooms: Mutex<HashMap<RoomId, RoomPresence>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryPresenceStore {
    /// Create a store with the given roster TTL.
    #[must_use]
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Number of rooms with a live roster. Expired rooms are pruned.
    #[must_use]
    pub fn room_count(&self) -> usize {
        let now = self.clock.now();
        let mut rooms = self.lock();
        sweep(&mut rooms, now);
        rooms.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RoomId, RoomPresence>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drop every room whose collection has expired, including rooms nobody
/// lists or joins again.
fn sweep(rooms: &mut HashMap<RoomId, RoomPresence>, now: Instant) {
    let before = rooms.len();
    rooms.retain(|_, presence| !presence.is_expired(now));
    let swept = before - rooms.len();
    if swept > 0 {
        debug!(swept, "Presence: expired rooms removed");
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn join(
        &self,
        room: &str,
        user_id: &str,
        entry: &PresenceEntry,
    ) -> Result<(), BackendError> {
        let now = self.clock.now();
        let mut rooms = self.lock();
        sweep(&mut rooms, now);

        let presence = rooms.entry(room.to_string()).or_insert_with(|| RoomPresence {
            members: HashMap::new(),
            expires_at: now,
        });

        let is_new = presence
            .members
            .insert(user_id.to_string(), entry.clone())
            .is_none();
        presence.expires_at = now + self.ttl;

        if is_new {
            debug!(room = %room, user = %user_id, "Presence: member joined");
        }
        Ok(())
    }

    async fn leave(&self, room: &str, user_id: &str) -> Result<(), BackendError> {
        let mut rooms = self.lock();

        if let Some(presence) = rooms.get_mut(room) {
            if presence.members.remove(user_id).is_some() {
                debug!(room = %room, user = %user_id, "Presence: member left");
            }
            if presence.members.is_empty() {
                rooms.remove(room);
            }
        }
        Ok(())
    }

    async fn list(&self, room: &str) -> Result<Vec<PresenceEntry>, BackendError> {
        let now = self.clock.now();
        let mut rooms = self.lock();

        match rooms.get(room) {
            Some(presence) if presence.is_expired(now) => {
                debug!(room = %room, "Presence: roster expired");
                rooms.remove(room);
                Ok(Vec::new())
            }
            Some(presence) => Ok(presence.members.values().cloned().collect()),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn entry(room: &str, user: &str) -> PresenceEntry {
        PresenceEntry {
            room_id: room.into(),
            user_id: user.into(),
            name: format!("User {user}"),
            role: "student".into(),
            joined_at: 0,
        }
    }

    fn store(ttl: Duration) -> (MemoryPresenceStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (MemoryPresenceStore::new(ttl, clock.clone()), clock)
    }

    fn user_ids(mut entries: Vec<PresenceEntry>) -> Vec<String> {
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries.into_iter().map(|e| e.user_id).collect()
    }

    #[tokio::test]
    async fn test_join_leave_list() {
        let (store, _) = store(DEFAULT_PRESENCE_TTL);

        store.join("S1", "a", &entry("S1", "a")).await.unwrap();
        store.join("S1", "b", &entry("S1", "b")).await.unwrap();
        assert_eq!(user_ids(store.list("S1").await.unwrap()), vec!["a", "b"]);

        store.leave("S1", "a").await.unwrap();
        assert_eq!(user_ids(store.list("S1").await.unwrap()), vec!["b"]);

        // Leaving twice, or from an unknown room, is harmless
        store.leave("S1", "a").await.unwrap();
        store.leave("nowhere", "a").await.unwrap();
        assert!(store.list("nowhere").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_has_no_duplicates() {
        let (store, _) = store(DEFAULT_PRESENCE_TTL);

        let mut updated = entry("S1", "a");
        store.join("S1", "a", &updated).await.unwrap();
        updated.role = "counselor".into();
        store.join("S1", "a", &updated).await.unwrap();

        let roster = store.list("S1").await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].role, "counselor");
    }

    #[tokio::test]
    async fn test_interleaved_joins_and_leaves() {
        let (store, _) = store(DEFAULT_PRESENCE_TTL);
        let ops: &[(&str, bool)] = &[
            ("a", true),
            ("b", true),
            ("a", false),
            ("c", true),
            ("a", true),
            ("b", false),
            ("d", true),
            ("c", true),
            ("d", false),
        ];

        for (user, join) in ops {
            if *join {
                store.join("S1", user, &entry("S1", user)).await.unwrap();
            } else {
                store.leave("S1", user).await.unwrap();
            }
        }

        assert_eq!(user_ids(store.list("S1").await.unwrap()), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_roster_expires_after_ttl() {
        let (store, clock) = store(Duration::from_secs(60));

        store.join("S1", "a", &entry("S1", "a")).await.unwrap();
        clock.advance(Duration::from_secs(59));
        assert_eq!(store.list("S1").await.unwrap().len(), 1);

        clock.advance(Duration::from_secs(1));
        assert!(store.list("S1").await.unwrap().is_empty());
        assert_eq!(store.room_count(), 0);
    }

    #[tokio::test]
    async fn test_join_refreshes_whole_room_ttl() {
        let (store, clock) = store(Duration::from_secs(60));

        store.join("S1", "a", &entry("S1", "a")).await.unwrap();
        clock.advance(Duration::from_secs(45));
        store.join("S1", "b", &entry("S1", "b")).await.unwrap();
        clock.advance(Duration::from_secs(45));

        // a's entry survives because the collection was refreshed by b
        assert_eq!(user_ids(store.list("S1").await.unwrap()), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_join_after_expiry_starts_fresh() {
        let (store, clock) = store(Duration::from_secs(60));

        store.join("S1", "a", &entry("S1", "a")).await.unwrap();
        clock.advance(Duration::from_secs(120));
        store.join("S1", "b", &entry("S1", "b")).await.unwrap();

        assert_eq!(user_ids(store.list("S1").await.unwrap()), vec!["b"]);
    }

    #[tokio::test]
    async fn test_abandoned_rooms_are_swept() {
        let (store, clock) = store(Duration::from_secs(60));

        for room in ["S1", "S2", "S3"] {
            store.join(room, "a", &entry(room, "a")).await.unwrap();
        }
        clock.advance(Duration::from_secs(61));

        // Nobody touches S1..S3 again; a join elsewhere still reclaims them
        store.join("S4", "b", &entry("S4", "b")).await.unwrap();
        assert_eq!(store.lock().len(), 1);
        assert!(store.lock().contains_key("S4"));

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.room_count(), 0);
        assert!(store.lock().is_empty());
    }
}
