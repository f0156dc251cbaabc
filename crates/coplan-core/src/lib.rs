//! # coplan-core
//!
//! Rooms, presence and message routing for the coplan collaboration layer.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Gateway** - Per-process service object owning everything below
//! - **MessageRouter** - Applies client events for a connection
//! - **RoomRegistry** - Local room membership
//! - **Fanout** - Publishes room events to the bus and delivers them locally
//! - **CircuitBreaker** - Guards bus publishes
//! - **PresenceStore** / **Bus** - Shared backends, with in-memory versions
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────┐
//! │   Gateway   │────▶│   Router    │────▶│   Fanout    │────▶│   Bus   │
//! └─────────────┘     └─────────────┘     │  (breaker)  │     └─────────┘
//!        ▲                   │            └─────────────┘          │
//!        │                   ▼                   ▲                 │
//!        │            ┌─────────────┐            │   subscription  │
//!        │            │  Presence   │            └─────────────────┘
//!        │            └─────────────┘                   │
//!        │                                              ▼
//!        │                                       ┌─────────────┐
//!        └───────────── local sockets ◀──────────│  Registry   │
//!                                                └─────────────┘
//! ```

pub mod backend;
pub mod breaker;
pub mod bus;
pub mod clock;
pub mod collaborators;
pub mod connection;
pub mod fanout;
pub mod gateway;
pub mod presence;
pub mod registry;
pub mod router;

pub use backend::{BackendError, Bus, BusMessage, BusStream, PresenceStore};
pub use breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
pub use bus::MemoryBus;
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    AuthError, Authenticator, Identity, StaticAuthenticator, StaticDirectory, UserDirectory,
};
pub use connection::{Connection, ConnectionId, ConnectionState, Membership};
pub use fanout::{Fanout, PublishOutcome};
pub use gateway::{Backends, Gateway};
pub use presence::{MemoryPresenceStore, DEFAULT_PRESENCE_TTL};
pub use registry::{RegistryStats, RoomRegistry};
pub use router::{MessageRouter, RouterError};
