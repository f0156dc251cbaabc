//! # coplan server
//!
//! Real-time collaboration gateway: rooms per student, live presence, and
//! chat/plan/comment relay across horizontally scaled instances.
//!
//! ## Usage
//!
//! ```bash
//! # Single instance, in-memory backends
//! COPLAN_AUTH__JWT_SECRET=... coplan
//!
//! # Shared Redis for multiple instances
//! COPLAN_STORE__BACKEND=redis COPLAN_REDIS__URL=redis://cache:6379/ coplan
//!
//! # With a config file (coplan.toml, /etc/coplan/coplan.toml, ~/.config/coplan/coplan.toml)
//! coplan
//! ```

mod auth;
mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use crate::config::{Config, StoreBackend};
use coplan_core::{
    Backends, Clock, Gateway, MemoryBus, MemoryPresenceStore, StaticDirectory, SystemClock,
};
use coplan_redis::RedisBackends;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coplan=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    info!("Starting coplan server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    let gateway = Arc::new(build_gateway(&config).await?);
    let _fanout = gateway
        .start()
        .await
        .context("Failed to subscribe to the bus")?;

    // Start the server
    handlers::run_server(config, gateway).await?;

    Ok(())
}

/// Wire the configured backends into a gateway.
async fn build_gateway(config: &Config) -> Result<Gateway> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let authenticator = Arc::new(auth::JwtAuthenticator::new(&config.auth.jwt_secret)?);

    let backends = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory backends; rooms are not shared between instances");
            Backends {
                presence: Arc::new(MemoryPresenceStore::new(config.presence.ttl(), clock.clone())),
                bus: Arc::new(MemoryBus::new()),
                directory: Arc::new(StaticDirectory::new()),
                authenticator,
            }
        }
        StoreBackend::Redis => {
            let redis = RedisBackends::connect(&config.redis.url, config.presence.ttl())
                .await
                .context("Failed to connect to Redis")?;
            Backends {
                presence: Arc::new(redis.presence),
                bus: Arc::new(redis.bus),
                directory: Arc::new(redis.directory),
                authenticator,
            }
        }
    };

    Ok(Gateway::new(
        backends,
        config.breaker.to_breaker_config(),
        clock,
    ))
}
