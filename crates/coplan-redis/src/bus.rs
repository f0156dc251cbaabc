//! Redis pub/sub bus.
//!
//! Each [`Channel`] maps to the Redis channel of the same name, and bodies are
//! JSON [`BusMessage`]s. A subscription runs on a dedicated pub/sub connection
//! that is re-established whenever it drops.

use crate::unavailable;
use async_trait::async_trait;
use coplan_core::{BackendError, Bus, BusMessage, BusStream};
use coplan_protocol::Channel;
use futures_util::stream::{self, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Delay before re-subscribing after the pub/sub connection drops.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    #[must_use]
    pub fn new(client: redis::Client, conn: ConnectionManager) -> Self {
        Self { client, conn }
    }
}

/// Decode a pub/sub payload. Returns `None` for foreign channels or bad
/// bodies.
fn decode_message(channel_name: &str, payload: &str) -> Option<(Channel, BusMessage)> {
    let channel = Channel::from_name(channel_name)?;
    match serde_json::from_str(payload) {
        Ok(message) => Some((channel, message)),
        Err(e) => {
            warn!(channel = %channel_name, error = %e, "Skipping unreadable bus message");
            None
        }
    }
}

async fn run_subscriber(
    client: redis::Client,
    channels: Vec<Channel>,
    sender: mpsc::UnboundedSender<(Channel, BusMessage)>,
) {
    let names: Vec<&'static str> = channels.iter().map(Channel::as_str).collect();

    while !sender.is_closed() {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                error!(error = %e, "Failed to open Redis pub/sub connection, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        if let Err(e) = pubsub.subscribe(names.clone()).await {
            error!(error = %e, "Failed to subscribe to bus channels, retrying");
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }
        info!(channels = ?names, "Subscribed to Redis channels");

        let mut messages = pubsub.into_on_message();
        while let Some(msg) = messages.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Failed to read pub/sub payload");
                    continue;
                }
            };
            let Some(decoded) = decode_message(msg.get_channel_name(), &payload) else {
                continue;
            };
            if sender.send(decoded).is_err() {
                debug!("Bus subscription dropped, stopping subscriber");
                return;
            }
        }

        warn!("Redis pub/sub stream ended, reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: Channel, message: &BusMessage) -> Result<(), BackendError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(channel.as_str(), payload)
            .await
            .map_err(unavailable)?;
        debug!(channel = %channel, room = %message.room_id, receivers, "Published to Redis");
        Ok(())
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<BusStream, BackendError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_subscriber(
            self.client.clone(),
            channels.to_vec(),
            sender,
        ));

        let stream = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
