//! Cross-instance event relay over Redis pub/sub
//!
//! Every instance publishes addressed events to one channel and runs a
//! subscriber that performs local delivery, so a user connected to any
//! instance receives events produced on any other (or by the worker).

use std::time::Duration;

use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use super::broadcaster::{Envelope, EventBroadcaster};

/// Base delay for subscriber reconnect backoff
const RECONNECT_BASE_DELAY_MS: u64 = 100;

/// Upper bound for subscriber reconnect backoff
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct RedisRelay {
    client: Client,
    publisher: ConnectionManager,
    channel: String,
}

impl RedisRelay {
    pub async fn connect(redis_url: &str, channel: impl Into<String>) -> Result<Self, RelayError> {
        let client = Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let channel = channel.into();

        tracing::info!(channel = %channel, "Connected event relay");
        Ok(Self {
            client,
            publisher,
            channel,
        })
    }

    pub async fn publish(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(&self.channel, payload).await?;

        tracing::debug!(
            channel = %self.channel,
            event_type = envelope.event.event_type(),
            receivers,
            "Published event"
        );
        Ok(())
    }

    /// Consume the channel forever, delivering each envelope locally
    ///
    /// Lost subscriptions are re-established with exponential backoff.
    pub fn spawn_subscriber(&self, broadcaster: EventBroadcaster) -> JoinHandle<()> {
        let client = self.client.clone();
        let channel = self.channel.clone();

        tokio::spawn(async move {
            loop {
                let strategy = ExponentialBackoff::from_millis(RECONNECT_BASE_DELAY_MS)
                    .max_delay(RECONNECT_MAX_DELAY)
                    .map(jitter);

                let mut pubsub = match Retry::start(strategy, || subscribe(&client, &channel)).await {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        tracing::error!(error = %e, "Event relay subscription gave up");
                        return;
                    }
                };

                tracing::info!(channel = %channel, "Event relay subscribed");
                let mut messages = pubsub.on_message();
                while let Some(msg) = messages.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(error = %e, "Unreadable relay payload");
                            continue;
                        }
                    };

                    match serde_json::from_str::<Envelope>(&payload) {
                        Ok(envelope) => {
                            broadcaster.deliver_local(&envelope).await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Malformed relay envelope");
                        }
                    }
                }

                tracing::warn!(channel = %channel, "Event relay subscription lost, reconnecting");
            }
        })
    }
}

async fn subscribe(client: &Client, channel: &str) -> Result<PubSub, RelayError> {
    let mut pubsub = client.get_async_pubsub().await.map_err(|e| {
        tracing::warn!(error = %e, "Event relay connect failed");
        e
    })?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}
