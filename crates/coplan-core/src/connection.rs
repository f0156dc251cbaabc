//! Connection handles.
//!
//! A [`Connection`] is created once a socket has authenticated. It holds the
//! identity, the room the connection has joined (at most one), and the
//! sending half of the connection's outbound queue. The socket task owns the
//! receiving half and drains it into the socket.

use crate::collaborators::Identity;
use coplan_protocol::{codec, RoomId, ServerEvent};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{trace, warn};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let sequence = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{timestamp:x}{sequence:04x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a connection has joined as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub room_id: RoomId,
    pub user_id: String,
    pub user_type: String,
}

/// Lifecycle state of an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Authenticated, not in a room.
    Connected,
    /// Joined to a room.
    InRoom(RoomId),
    /// Closed; cleanup has run or is running.
    Terminated,
}

/// An authenticated connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    membership: Mutex<Option<Membership>>,
    outbound: mpsc::UnboundedSender<String>,
    terminated: AtomicBool,
}

impl Connection {
    /// Create a connection together with its outbound queue.
    #[must_use]
    pub fn channel(identity: Identity) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: ConnectionId::generate(),
            identity,
            membership: Mutex::new(None),
            outbound,
            terminated: AtomicBool::new(false),
        });
        (connection, receiver)
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Current membership, if the connection has joined a room.
    #[must_use]
    pub fn membership(&self) -> Option<Membership> {
        self.lock().clone()
    }

    /// Replace the membership, returning the previous one.
    pub fn set_membership(&self, membership: Option<Membership>) -> Option<Membership> {
        std::mem::replace(&mut *self.lock(), membership)
    }

    /// Room the connection has joined, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        self.lock().as_ref().map(|m| m.room_id.clone())
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.terminated.load(Ordering::Acquire) {
            return ConnectionState::Terminated;
        }
        match self.room_id() {
            Some(room) => ConnectionState::InRoom(room),
            None => ConnectionState::Connected,
        }
    }

    /// Whether frames can still be delivered.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.terminated.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    /// Encode and queue an event.
    ///
    /// Returns `false` if the connection is closed or the event could not be
    /// encoded.
    pub fn send(&self, event: &ServerEvent) -> bool {
        match codec::encode(event) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(connection = %self.id, error = %e, "Failed to encode event");
                false
            }
        }
    }

    /// Queue a pre-encoded frame.
    pub fn send_text(&self, text: String) -> bool {
        if !self.is_open() {
            trace!(connection = %self.id, "Dropping frame for closed connection");
            return false;
        }
        self.outbound.send(text).is_ok()
    }

    /// Mark the connection terminated.
    ///
    /// Returns `true` only for the first call.
    pub fn terminate(&self) -> bool {
        !self.terminated.swap(true, Ordering::AcqRel)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Membership>> {
        self.membership.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
