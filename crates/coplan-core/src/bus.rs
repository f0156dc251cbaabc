//! In-memory pub/sub bus.
//!
//! A `tokio::sync::broadcast` channel shared by every clone. Two gateways
//! holding clones of the same bus behave like two instances behind a shared
//! broker.

use crate::backend::{BackendError, Bus, BusMessage, BusStream};
use async_trait::async_trait;
use coplan_protocol::Channel;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default broadcast capacity.
const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Bus for single-instance mode and tests.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<(Channel, BusMessage)>,
}

impl MemoryBus {
    /// Create a new bus.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a new bus with a specific capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: Channel, message: &BusMessage) -> Result<(), BackendError> {
        // No subscribers is not an error
        let receivers = self.sender.send((channel, message.clone())).unwrap_or_default();
        trace!(channel = %channel, room = %message.room_id, receivers, "Published message");
        Ok(())
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<BusStream, BackendError> {
        let receiver = self.sender.subscribe();
        let wanted = channels.to_vec();

        let stream = stream::unfold((receiver, wanted), |(mut receiver, wanted)| async move {
            loop {
                match receiver.recv().await {
                    Ok((channel, message)) if wanted.contains(&channel) => {
                        return Some(((channel, message), (receiver, wanted)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Bus subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
