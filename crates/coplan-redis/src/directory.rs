//! Redis user directory.
//!
//! Display names live in the `users:names` hash (user id -> name), kept
//! current by whichever service owns user records.

use crate::unavailable;
use async_trait::async_trait;
use coplan_core::{BackendError, UserDirectory};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Hash holding display names.
pub const USER_NAMES_KEY: &str = "users:names";

#[derive(Clone)]
pub struct RedisUserDirectory {
    conn: ConnectionManager,
}

impl RedisUserDirectory {
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl UserDirectory for RedisUserDirectory {
    async fn lookup_name(&self, user_id: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn.clone();
        let name: Option<String> = conn
            .hget(USER_NAMES_KEY, user_id)
            .await
            .map_err(unavailable)?;
        Ok(name.filter(|n| !n.is_empty()))
    }
}
