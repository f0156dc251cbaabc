//! # coplan-redis
//!
//! Redis backends for the coplan collaboration layer.
//!
//! - **RedisPresenceStore** - Room rosters as hashes with a TTL
//! - **RedisBus** - Room events over Redis pub/sub
//! - **RedisUserDirectory** - Display names from a shared hash
//!
//! Every instance pointed at the same Redis server shares rosters and room
//! events.
//!
//! ```rust,ignore
//! use coplan_redis::RedisBackends;
//!
//! let backends = RedisBackends::connect("redis://127.0.0.1/", ttl).await?;
//! ```

pub mod bus;
pub mod directory;
pub mod store;

pub use bus::RedisBus;
pub use directory::RedisUserDirectory;
pub use store::RedisPresenceStore;

use coplan_core::BackendError;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::info;

/// Map a Redis error onto the backend taxonomy.
pub(crate) fn unavailable(e: redis::RedisError) -> BackendError {
    BackendError::Unavailable(e.to_string())
}

/// All Redis-backed collaborators sharing one server.
pub struct RedisBackends {
    pub presence: RedisPresenceStore,
    pub bus: RedisBus,
    pub directory: RedisUserDirectory,
}

impl RedisBackends {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str, presence_ttl: Duration) -> Result<Self, BackendError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;
        info!(tls = url.starts_with("rediss://"), "Connected to Redis");

        Ok(Self {
            presence: RedisPresenceStore::new(conn.clone(), presence_ttl),
            bus: RedisBus::new(client, conn.clone()),
            directory: RedisUserDirectory::new(conn),
        })
    }
}
