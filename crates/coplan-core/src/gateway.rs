//! The per-process service object.
//!
//! A [`Gateway`] owns the local room registry, the fanout (and its breaker)
//! and the router, plus the injected backends. Transports hand it
//! credentials, inbound frames and disconnects; it hands back connections
//! whose outbound queues the transport drains into sockets.

use crate::backend::{BackendError, Bus, PresenceStore};
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::clock::Clock;
use crate::collaborators::{AuthError, Authenticator, UserDirectory};
use crate::connection::Connection;
use crate::fanout::Fanout;
use crate::registry::RoomRegistry;
use crate::router::MessageRouter;
use coplan_protocol::{codec, Decoded, ProtocolError, ServerEvent};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reply sent when a frame cannot be parsed.
pub const INVALID_FORMAT: &str = "Invalid message format";

/// Reply sent when a handler fails unexpectedly.
pub const INTERNAL_ERROR: &str = "Internal server error";

/// The external dependencies a gateway is built on.
#[derive(Clone)]
pub struct Backends {
    pub presence: Arc<dyn PresenceStore>,
    pub bus: Arc<dyn Bus>,
    pub directory: Arc<dyn UserDirectory>,
    pub authenticator: Arc<dyn Authenticator>,
}

/// Connection gateway for one process.
pub struct Gateway {
    registry: Arc<RoomRegistry>,
    fanout: Arc<Fanout>,
    router: MessageRouter,
    authenticator: Arc<dyn Authenticator>,
    connections: AtomicUsize,
}

impl Gateway {
    /// Create a gateway.
    #[must_use]
    pub fn new(backends: Backends, breaker: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let fanout = Arc::new(Fanout::new(
            backends.bus,
            CircuitBreaker::new(breaker, clock.clone()),
            registry.clone(),
        ));
        let router = MessageRouter::new(
            registry.clone(),
            backends.presence,
            backends.directory,
            fanout.clone(),
            clock,
        );

        Self {
            registry,
            fanout,
            router,
            authenticator: backends.authenticator,
            connections: AtomicUsize::new(0),
        }
    }

    /// Subscribe to the bus and start delivering to local connections.
    ///
    /// Call once per process.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus subscription fails.
    pub async fn start(&self) -> Result<JoinHandle<()>, BackendError> {
        let stream = self.fanout.subscribe().await?;
        Ok(tokio::spawn(self.fanout.clone().run(stream)))
    }

    /// Authenticate a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential is missing or rejected. The
    /// transport must close the socket without further work.
    pub async fn accept(
        &self,
        credential: Option<&str>,
    ) -> Result<(Arc<Connection>, mpsc::UnboundedReceiver<String>), AuthError> {
        let credential = credential
            .filter(|c| !c.is_empty())
            .ok_or(AuthError::MissingCredential)?;
        let identity = self.authenticator.authenticate(credential).await?;

        let (connection, outbound) = Connection::channel(identity);
        let active = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            connection = %connection.id(),
            user = %connection.identity().id,
            active,
            "Connection accepted"
        );
        Ok((connection, outbound))
    }

    /// Handle an inbound text frame.
    pub async fn handle_text(&self, connection: &Arc<Connection>, text: &str) {
        self.handle_decoded(connection, codec::decode(text)).await;
    }

    /// Handle an inbound binary frame as UTF-8 text.
    pub async fn handle_bytes(&self, connection: &Arc<Connection>, data: &[u8]) {
        self.handle_decoded(connection, codec::decode_bytes(data))
            .await;
    }

    async fn handle_decoded(
        &self,
        connection: &Arc<Connection>,
        decoded: Result<Decoded, ProtocolError>,
    ) {
        let event = match decoded {
            Ok(Decoded::Event(event)) => event,
            Ok(Decoded::Unknown(kind)) => {
                debug!(connection = %connection.id(), kind = %kind, "Unrecognized message type");
                connection.send(&ServerEvent::info(format!(
                    "Unrecognized message type: {kind}"
                )));
                return;
            }
            Err(e) => {
                warn!(connection = %connection.id(), error = %e, "Malformed frame");
                connection.send(&ServerEvent::error(INVALID_FORMAT));
                return;
            }
        };

        let kind = event.kind();
        let room_before = connection.room_id();
        let result = AssertUnwindSafe(self.router.dispatch(connection, event))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection = %connection.id(), kind, error = %e, "Rejected message");
                connection.send(&ServerEvent::error(e.to_string()));
            }
            Err(panic) => {
                error!(
                    connection = %connection.id(),
                    kind,
                    panic = panic_message(&*panic),
                    "Message handler panicked"
                );
                if connection.room_id() != room_before {
                    self.roll_back_join(connection).await;
                }
                connection.send(&ServerEvent::error(INTERNAL_ERROR));
            }
        }
    }

    /// Undo a join that panicked after the membership moved, so the
    /// connection ends up in no room rather than half-joined.
    async fn roll_back_join(&self, connection: &Arc<Connection>) {
        let left = AssertUnwindSafe(self.router.leave_room(connection))
            .catch_unwind()
            .await;
        match left {
            Ok(room) => warn!(
                connection = %connection.id(),
                room = room.as_deref().unwrap_or("-"),
                "Rolled back interrupted join"
            ),
            Err(panic) => {
                // Presence may be stale; the local registry is still cleared.
                connection.set_membership(None);
                self.registry.leave(connection.id());
                error!(
                    connection = %connection.id(),
                    panic = panic_message(&*panic),
                    "Join rollback panicked"
                );
            }
        }
    }

    /// Clean up after a closed connection.
    ///
    /// Runs at most once per connection; later calls are no-ops.
    pub async fn disconnect(&self, connection: &Arc<Connection>) {
        if !connection.terminate() {
            return;
        }
        let active = self
            .connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);

        let left = AssertUnwindSafe(self.router.leave_room(connection))
            .catch_unwind()
            .await;
        match left {
            Ok(room) => info!(
                connection = %connection.id(),
                room = room.as_deref().unwrap_or("-"),
                active,
                "Connection closed"
            ),
            Err(panic) => error!(
                connection = %connection.id(),
                panic = panic_message(&*panic),
                "Connection cleanup panicked"
            ),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::clock::ManualClock;
    use crate::collaborators::{Identity, StaticAuthenticator, StaticDirectory};
    use crate::connection::ConnectionState;
    use crate::presence::MemoryPresenceStore;
    use coplan_protocol::{ClientEvent, PresenceAction, PresenceEntry};
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Cluster {
        bus: MemoryBus,
        presence: Arc<MemoryPresenceStore>,
        clock: Arc<ManualClock>,
    }

    impl Cluster {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new());
            Self {
                bus: MemoryBus::new(),
                presence: Arc::new(MemoryPresenceStore::new(
                    Duration::from_secs(3600),
                    clock.clone(),
                )),
                clock,
            }
        }

        async fn instance(&self) -> Gateway {
            let authenticator = StaticAuthenticator::new()
                .with_token("student", Identity::new("a", "Alice", "student"))
                .with_token("counselor", Identity::new("b", "Bob", "counselor"));
            let directory: StaticDirectory =
                [("a", "Alice"), ("b", "Bob")].into_iter().collect();

            let gateway = Gateway::new(
                Backends {
                    presence: self.presence.clone(),
                    bus: Arc::new(self.bus.clone()),
                    directory: Arc::new(directory),
                    authenticator: Arc::new(authenticator),
                },
                BreakerConfig::default(),
                self.clock.clone(),
            );
            gateway.start().await.unwrap();
            gateway
        }
    }

    struct Client {
        conn: Arc<Connection>,
        rx: mpsc::UnboundedReceiver<String>,
    }

    impl Client {
        async fn connect(gateway: &Gateway, token: &str) -> Self {
            let (conn, rx) = gateway.accept(Some(token)).await.unwrap();
            Self { conn, rx }
        }

        async fn send(&self, gateway: &Gateway, event: Value) {
            gateway.handle_text(&self.conn, &event.to_string()).await;
        }

        async fn join(&mut self, gateway: &Gateway, room: &str) {
            let identity = self.conn.identity().clone();
            let event = ClientEvent::join(room, identity.id, identity.role);
            gateway
                .handle_text(&self.conn, &codec::encode_client(&event).unwrap())
                .await;
            self.expect(|e| matches!(e, ServerEvent::RoomJoined { .. }))
                .await;
        }

        async fn recv(&mut self) -> Option<ServerEvent> {
            let text = tokio::time::timeout(Duration::from_millis(500), self.rx.recv())
                .await
                .ok()??;
            Some(codec::decode_server(&text).unwrap())
        }

        /// Receive until an event matches, skipping others.
        async fn expect(&mut self, wanted: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
            loop {
                match self.recv().await {
                    Some(event) if wanted(&event) => return event,
                    Some(_) => continue,
                    None => panic!("Expected event was not received"),
                }
            }
        }

        /// Drain every queued frame.
        async fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Some(event) = self.recv().await {
                events.push(event);
            }
            events
        }
    }

    fn is_chat(event: &ServerEvent) -> bool {
        matches!(event, ServerEvent::ChatMessage(_))
    }

    fn roster_of(event: &ServerEvent) -> Vec<String> {
        match event {
            ServerEvent::PresenceUpdate { users, .. } => {
                let mut ids: Vec<String> = users.iter().map(|u| u.user_id.clone()).collect();
                ids.sort();
                ids
            }
            other => panic!("Expected presence update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_accept_requires_credential() {
        let cluster = Cluster::new();
        let gateway = cluster.instance().await;

        assert!(matches!(
            gateway.accept(None).await,
            Err(AuthError::MissingCredential)
        ));
        assert!(matches!(
            gateway.accept(Some("")).await,
            Err(AuthError::MissingCredential)
        ));
        assert!(matches!(
            gateway.accept(Some("forged")).await,
            Err(AuthError::InvalidCredential(_))
        ));
        assert_eq!(gateway.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_chat_reaches_other_member_once() {
        let cluster = Cluster::new();
        let gateway = cluster.instance().await;
        let mut alice = Client::connect(&gateway, "student").await;
        let mut bob = Client::connect(&gateway, "counselor").await;

        alice.join(&gateway, "S1").await;
        bob.join(&gateway, "S1").await;

        alice
            .send(&gateway, json!({ "type": "chat-message", "message": "hello", "sender": "Student" }))
            .await;

        let chats: Vec<ServerEvent> = bob.drain().await.into_iter().filter(is_chat).collect();
        assert_eq!(chats.len(), 1);
        let ServerEvent::ChatMessage(chat) = &chats[0] else {
            unreachable!()
        };
        assert_eq!(chat.message, "hello");

        // No self-echo
        assert!(!alice.drain().await.iter().any(is_chat));
    }

    #[tokio::test]
    async fn test_chat_crosses_instances() {
        let cluster = Cluster::new();
        let first = cluster.instance().await;
        let second = cluster.instance().await;
        let mut alice = Client::connect(&first, "student").await;
        let mut bob = Client::connect(&second, "counselor").await;

        alice.join(&first, "S1").await;
        bob.join(&second, "S1").await;

        // Bob's roster, delivered over the bus, lists both members
        let roster = alice
            .expect(|e| matches!(e, ServerEvent::PresenceUpdate { users, .. } if users.len() == 2))
            .await;
        assert_eq!(roster_of(&roster), vec!["a", "b"]);

        alice
            .send(&first, json!({ "type": "chat-message", "message": "hello", "sender": "Student" }))
            .await;

        let chats: Vec<ServerEvent> = bob.drain().await.into_iter().filter(is_chat).collect();
        assert_eq!(chats.len(), 1);
        assert!(!alice.drain().await.iter().any(is_chat));
    }

    #[tokio::test]
    async fn test_relay_fidelity() {
        let cluster = Cluster::new();
        let first = cluster.instance().await;
        let second = cluster.instance().await;
        let mut alice = Client::connect(&first, "student").await;
        let mut bob = Client::connect(&second, "counselor").await;
        alice.join(&first, "S1").await;
        bob.join(&second, "S1").await;
        alice.drain().await;

        let plans = json!([
            { "id": 7, "name": "Plan A", "years": { "9": ["ENG101"], "10": [] }, "meta": null },
            { "id": 8, "name": "Plan \"B\"", "years": {}, "score": 3.5, "flags": [true, false] }
        ]);
        let comments = json!([{ "author": "Bob", "text": "Looks good", "replies": [] }]);

        bob.send(&second, json!({ "type": "plans-update", "plans": plans, "sender": "Counselor" }))
            .await;
        bob.send(&second, json!({ "type": "comments-update", "comments": comments, "sender": "Counselor" }))
            .await;

        let received = alice.drain().await;
        let got_plans = received.iter().find_map(|e| match e {
            ServerEvent::PlansUpdate(u) => Some(u.plans.clone()),
            _ => None,
        });
        let got_comments = received.iter().find_map(|e| match e {
            ServerEvent::CommentsUpdate(u) => Some(u.comments.clone()),
            _ => None,
        });
        assert_eq!(got_plans, Some(plans));
        assert_eq!(got_comments, Some(comments));
    }

    #[tokio::test]
    async fn test_abandoned_presence_expires() {
        let cluster = Cluster::new();
        let gateway = cluster.instance().await;
        let mut alice = Client::connect(&gateway, "student").await;
        alice.join(&gateway, "S1").await;

        // Drop out without leave or cleanup reaching the store
        let entry: PresenceEntry = cluster.presence.list("S1").await.unwrap().remove(0);
        assert_eq!(entry.user_id, "a");
        drop(alice);

        cluster.clock.advance(Duration::from_secs(3600));
        assert!(cluster.presence.list("S1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_moves_presence() {
        let cluster = Cluster::new();
        let gateway = cluster.instance().await;
        let mut alice = Client::connect(&gateway, "student").await;
        let mut bob = Client::connect(&gateway, "counselor").await;

        bob.join(&gateway, "S1").await;
        alice.join(&gateway, "S1").await;
        bob.drain().await;

        alice.join(&gateway, "S2").await;

        assert!(!gateway.registry().contains("S1", alice.conn.id()));
        assert!(gateway.registry().contains("S2", alice.conn.id()));

        let leave = bob
            .expect(|e| matches!(e, ServerEvent::PresenceUpdate { action: PresenceAction::Leave, .. }))
            .await;
        assert_eq!(roster_of(&leave), vec!["b"]);

        let s1: Vec<String> = cluster
            .presence
            .list("S1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.user_id)
            .collect();
        assert_eq!(s1, vec!["b"]);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_once() {
        let cluster = Cluster::new();
        let gateway = cluster.instance().await;
        let mut alice = Client::connect(&gateway, "student").await;
        let mut bob = Client::connect(&gateway, "counselor").await;

        bob.join(&gateway, "S1").await;
        alice.join(&gateway, "S1").await;
        bob.drain().await;
        assert_eq!(gateway.connection_count(), 2);

        gateway.disconnect(&alice.conn).await;
        gateway.disconnect(&alice.conn).await;

        assert_eq!(gateway.connection_count(), 1);
        assert!(!gateway.registry().contains("S1", alice.conn.id()));

        let updates: Vec<ServerEvent> = bob
            .drain()
            .await
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::PresenceUpdate { .. }))
            .collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(roster_of(&updates[0]), vec!["b"]);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames() {
        let cluster = Cluster::new();
        let gateway = cluster.instance().await;
        let mut alice = Client::connect(&gateway, "student").await;
        let mut bob = Client::connect(&gateway, "counselor").await;
        alice.join(&gateway, "S1").await;
        bob.join(&gateway, "S1").await;
        alice.drain().await;
        bob.drain().await;

        gateway.handle_text(&alice.conn, "Raw string message").await;
        assert_eq!(alice.recv().await, Some(ServerEvent::error(INVALID_FORMAT)));

        alice
            .send(&gateway, json!({ "type": "test", "data": "Hello from frontend!" }))
            .await;
        assert_eq!(
            alice.recv().await,
            Some(ServerEvent::info("Unrecognized message type: test"))
        );

        gateway.handle_bytes(&alice.conn, &[0xff, 0x00]).await;
        assert_eq!(alice.recv().await, Some(ServerEvent::error(INVALID_FORMAT)));

        // Connection survives, nothing was broadcast
        assert!(alice.conn.is_open());
        assert!(bob.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_chat_before_join() {
        let cluster = Cluster::new();
        let gateway = cluster.instance().await;
        let mut alice = Client::connect(&gateway, "student").await;

        alice
            .send(&gateway, json!({ "type": "chat-message", "message": "hi" }))
            .await;
        assert_eq!(
            alice.recv().await,
            Some(ServerEvent::error("Join a student room first"))
        );
    }

    /// Presence store whose upserts panic.
    struct PanickingStore;

    #[async_trait::async_trait]
    impl PresenceStore for PanickingStore {
        async fn join(&self, _: &str, _: &str, _: &PresenceEntry) -> Result<(), BackendError> {
            panic!("presence exploded");
        }
        async fn leave(&self, _: &str, _: &str) -> Result<(), BackendError> {
            Ok(())
        }
        async fn list(&self, _: &str) -> Result<Vec<PresenceEntry>, BackendError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_panicking_join_is_rolled_back() {
        let cluster = Cluster::new();
        let gateway = Gateway::new(
            Backends {
                presence: Arc::new(PanickingStore),
                bus: Arc::new(cluster.bus.clone()),
                directory: Arc::new(StaticDirectory::new()),
                authenticator: Arc::new(
                    StaticAuthenticator::new()
                        .with_token("student", Identity::new("a", "Alice", "student")),
                ),
            },
            BreakerConfig::default(),
            cluster.clock.clone(),
        );
        gateway.start().await.unwrap();
        let mut alice = Client::connect(&gateway, "student").await;

        alice
            .send(&gateway, json!({ "type": "join-student-room", "data": { "studentId": "S1" } }))
            .await;

        let frames = alice.drain().await;
        assert_eq!(frames, vec![ServerEvent::error(INTERNAL_ERROR)]);
        assert!(!gateway.registry().contains("S1", alice.conn.id()));
        assert!(!gateway.registry().room_exists("S1"));
        assert_eq!(alice.conn.state(), ConnectionState::Connected);

        // The connection keeps working afterwards
        assert!(alice.conn.is_open());
        alice
            .send(&gateway, json!({ "type": "chat-message", "message": "hi" }))
            .await;
        assert_eq!(
            alice.recv().await,
            Some(ServerEvent::error("Join a student room first"))
        );
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
