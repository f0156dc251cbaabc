//! Redis presence store.
//!
//! Each room is a hash at `presence:<room>` whose fields are user ids and
//! whose values are JSON presence entries. The whole hash expires after the
//! TTL, which is refreshed on every join.

use crate::unavailable;
use async_trait::async_trait;
use coplan_core::{BackendError, PresenceStore};
use coplan_protocol::PresenceEntry;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Key prefix for room rosters.
pub const PRESENCE_KEY_PREFIX: &str = "presence:";

/// Redis key holding a room's roster.
#[must_use]
pub fn presence_key(room: &str) -> String {
    format!("{PRESENCE_KEY_PREFIX}{room}")
}

/// Presence store shared by every instance.
#[derive(Clone)]
pub struct RedisPresenceStore {
    conn: ConnectionManager,
    ttl_secs: i64,
}

impl RedisPresenceStore {
    #[must_use]
    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self {
            conn,
            ttl_secs: i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1),
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn join(
        &self,
        room: &str,
        user_id: &str,
        entry: &PresenceEntry,
    ) -> Result<(), BackendError> {
        let key = presence_key(room);
        let value = serde_json::to_string(entry)?;
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .hset(&key, user_id, value)
            .ignore()
            .expire(&key, self.ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        debug!(room = %room, user = %user_id, "Presence: stored entry");
        Ok(())
    }

    async fn leave(&self, room: &str, user_id: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .hdel(presence_key(room), user_id)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn list(&self, room: &str) -> Result<Vec<PresenceEntry>, BackendError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(presence_key(room))
            .await
            .map_err(unavailable)?;

        Ok(fields
            .into_iter()
            .filter_map(|(user_id, value)| match serde_json::from_str(&value) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(room = %room, user = %user_id, error = %e, "Skipping unreadable presence entry");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_key() {
        assert_eq!(presence_key("S1"), "presence:S1");
        assert_eq!(presence_key("42"), "presence:42");
    }

    async fn connect() -> ConnectionManager {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let client = redis::Client::open(url).unwrap();
        ConnectionManager::new(client).await.unwrap()
    }

    fn entry(room: &str, user: &str) -> PresenceEntry {
        PresenceEntry {
            room_id: room.into(),
            user_id: user.into(),
            name: "Ada".into(),
            role: "student".into(),
            joined_at: 1,
        }
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_join_list_leave() {
        let conn = connect().await;
        let store = RedisPresenceStore::new(conn.clone(), Duration::from_secs(60));
        let room = format!("test-{}", std::process::id());

        store.join(&room, "a", &entry(&room, "a")).await.unwrap();
        store.join(&room, "b", &entry(&room, "b")).await.unwrap();
        store.join(&room, "a", &entry(&room, "a")).await.unwrap();
        assert_eq!(store.list(&room).await.unwrap().len(), 2);

        let mut raw = conn.clone();
        let ttl: i64 = raw.ttl(presence_key(&room)).await.unwrap();
        assert!(ttl > 0 && ttl <= 60);

        store.leave(&room, "a").await.unwrap();
        store.leave(&room, "b").await.unwrap();
        assert!(store.list(&room).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_list_skips_bad_values() {
        let conn = connect().await;
        let store = RedisPresenceStore::new(conn.clone(), Duration::from_secs(60));
        let room = format!("test-bad-{}", std::process::id());

        store.join(&room, "a", &entry(&room, "a")).await.unwrap();
        let mut raw = conn.clone();
        let _: i64 = raw.hset(presence_key(&room), "b", "not json").await.unwrap();

        let roster = store.list(&room).await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].user_id, "a");

        let _: i64 = raw.del(presence_key(&room)).await.unwrap();
    }
}
