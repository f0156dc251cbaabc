//! Pub/sub fanout.
//!
//! Outbound: every room event goes to the bus through the circuit breaker,
//! never directly to local sockets, so that local and remote members see the
//! same stream. Inbound: messages from the bus subscription are delivered to
//! the room's locally-held connections.

use crate::backend::{BackendError, Bus, BusMessage, BusStream};
use crate::breaker::{BreakerError, CircuitBreaker};
use crate::registry::RoomRegistry;
use coplan_protocol::{codec, Channel, ServerEvent};
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Result of a guarded publish. Logged and counted, never shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The bus accepted the message.
    Delivered,
    /// The circuit is open; nothing was sent.
    Skipped,
    /// The bus call failed or timed out.
    Failed,
}

/// Bridges the bus and the local room registry.
pub struct Fanout {
    bus: Arc<dyn Bus>,
    breaker: CircuitBreaker,
    registry: Arc<RoomRegistry>,
}

impl Fanout {
    #[must_use]
    pub fn new(bus: Arc<dyn Bus>, breaker: CircuitBreaker, registry: Arc<RoomRegistry>) -> Self {
        Self {
            bus,
            breaker,
            registry,
        }
    }

    /// The breaker guarding publishes.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Publish a room event to every instance.
    ///
    /// Never fails: errors are logged and reported in the outcome only.
    pub async fn publish(
        &self,
        room: &str,
        event: ServerEvent,
        origin: Option<String>,
    ) -> PublishOutcome {
        let Some(channel) = event.channel() else {
            warn!(room = %room, "Event has no bus channel, not published");
            return PublishOutcome::Failed;
        };
        let message = BusMessage::new(room, event, origin);

        let result = self
            .breaker
            .call(|| self.bus.publish(channel, &message))
            .await;

        match result {
            Ok(()) => {
                trace!(channel = %channel, room = %room, "Published to bus");
                PublishOutcome::Delivered
            }
            Err(BreakerError::Open) => {
                debug!(channel = %channel, room = %room, "Bus circuit open, publish skipped");
                PublishOutcome::Skipped
            }
            Err(e) => {
                warn!(channel = %channel, room = %room, bus = self.bus.name(), error = %e, "Bus publish failed");
                PublishOutcome::Failed
            }
        }
    }

    /// Subscribe to every room channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus refuses the subscription.
    pub async fn subscribe(&self) -> Result<BusStream, BackendError> {
        let stream = self.bus.subscribe(&Channel::ALL).await?;
        info!(bus = self.bus.name(), channels = Channel::ALL.len(), "Subscribed to bus");
        Ok(stream)
    }

    /// Deliver a bus message to the room's local members.
    ///
    /// Members joined as the message's origin user are skipped. Returns the
    /// number of connections the frame was queued for.
    pub fn deliver(&self, channel: Channel, message: &BusMessage) -> usize {
        let members = self.registry.members(&message.room_id);
        if members.is_empty() {
            return 0;
        }

        let text = match codec::encode(&message.data) {
            Ok(text) => text,
            Err(e) => {
                warn!(channel = %channel, room = %message.room_id, error = %e, "Failed to encode bus event");
                return 0;
            }
        };

        let mut delivered = 0;
        for connection in members {
            if !connection.is_open() {
                continue;
            }
            if let Some(origin) = &message.origin {
                let is_sender = connection
                    .membership()
                    .is_some_and(|m| &m.user_id == origin);
                if is_sender {
                    continue;
                }
            }
            if connection.send_text(text.clone()) {
                delivered += 1;
            }
        }

        trace!(channel = %channel, room = %message.room_id, recipients = delivered, "Delivered bus message");
        delivered
    }

    /// Drain a subscription, delivering each message locally.
    pub async fn run(self: Arc<Self>, mut stream: BusStream) {
        while let Some((channel, message)) = stream.next().await {
            self.deliver(channel, &message);
        }
        info!(bus = self.bus.name(), "Bus subscription ended");
    }
}
