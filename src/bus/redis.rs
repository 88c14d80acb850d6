//! Redis pub/sub transport.
//!
//! Publishing goes through a pooled connection (`PUBLISH`). Each
//! subscription owns a dedicated pub/sub connection that follows the wanted
//! topic set, and reconnects with exponential backoff whenever the
//! connection drops.
//!
//! ```text
//! gateway A ──PUBLISH task-events:all──▶ Redis ──▶ SUBSCRIBE (gateway A, B, C)
//! ```

use async_trait::async_trait;
use deadpool_redis::redis::aio::PubSub;
use deadpool_redis::redis::{cmd, Client};
use deadpool_redis::{Config, Pool, Runtime};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Backoff, BusError, BusHandler, EventBus, TopicSet};

/// Event bus backed by a shared Redis server.
pub struct RedisBus {
    pool: Pool,
    client: Client,
    backoff: Backoff,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Why a pub/sub session ended.
enum SessionEnd {
    /// The connection dropped; reconnect
    Lost,
    /// The owner stopped wanting messages; stop for good
    Finished,
}

impl RedisBus {
    /// Build the pool and pub/sub client for `url`.
    ///
    /// An unreachable server is not fatal: the failure is logged and
    /// publishes and subscriptions keep retrying on their own.
    pub async fn connect(url: &str, backoff: Backoff) -> Result<Self, BusError> {
        let client = Client::open(url).map_err(|e| BusError::Unavailable(e.to_string()))?;
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        let (shutdown, _) = watch::channel(false);

        let bus = Self {
            pool,
            client,
            backoff,
            shutdown: Arc::new(shutdown),
        };

        match bus.ping().await {
            Ok(()) => info!("Redis bus connected"),
            Err(e) => warn!(error = %e, "Redis bus not reachable yet, will keep retrying"),
        }

        Ok(bus)
    }

    /// Pool shared with other Redis users in the process (e.g. the cache).
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }
}

#[async_trait]
impl EventBus for RedisBus {
    fn name(&self) -> &str {
        "redis"
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        if *self.shutdown.borrow() {
            return Err(BusError::Closed);
        }

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let receivers: i64 = cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Command(e.to_string()))?;

        debug!(topic = %topic, receivers = receivers, "Published to Redis");
        Ok(())
    }

    fn subscribe(
        &self,
        topics: watch::Receiver<TopicSet>,
        handler: Arc<dyn BusHandler>,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        let backoff = self.backoff.clone();
        let shutdown = self.shutdown.subscribe();

        tokio::spawn(run_subscription(client, topics, handler, shutdown, backoff))
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Command(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
        self.pool.close();
        info!("Redis bus closed");
    }
}

/// Keep a pub/sub connection alive for as long as the owner wants topics.
async fn run_subscription(
    client: Client,
    mut topics: watch::Receiver<TopicSet>,
    handler: Arc<dyn BusHandler>,
    mut shutdown: watch::Receiver<bool>,
    mut backoff: Backoff,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                match run_session(&mut pubsub, &mut topics, &handler, &mut shutdown, &mut backoff)
                    .await
                {
                    SessionEnd::Finished => return,
                    SessionEnd::Lost => {
                        warn!("Redis subscription dropped, resubscribing");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, attempt = backoff.attempt(), "Redis pub/sub connect failed");
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Waiting before resubscribe");
        if !sleep_unless_shutdown(delay, &mut shutdown).await {
            return;
        }
    }
}

/// Serve one pub/sub connection until it drops or the owner is done.
async fn run_session(
    pubsub: &mut PubSub,
    topics: &mut watch::Receiver<TopicSet>,
    handler: &Arc<dyn BusHandler>,
    shutdown: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> SessionEnd {
    let mut subscribed = TopicSet::new();

    loop {
        let wanted = topics.borrow_and_update().clone();
        if let Err(e) = sync_topics(pubsub, &mut subscribed, &wanted).await {
            warn!(error = %e, "Failed to update Redis subscriptions");
            return SessionEnd::Lost;
        }
        backoff.reset();

        let mut messages = Box::pin(pubsub.on_message());
        loop {
            tokio::select! {
                message = messages.next() => match message {
                    Some(message) => {
                        let topic = message.get_channel_name().to_string();
                        match message.get_payload::<String>() {
                            Ok(payload) => handler.on_message(&topic, &payload).await,
                            Err(e) => warn!(topic = %topic, error = %e, "Non-text bus payload dropped"),
                        }
                    }
                    None => return SessionEnd::Lost,
                },
                changed = topics.changed() => {
                    if changed.is_err() {
                        return SessionEnd::Finished;
                    }
                    // Release the message stream so the connection can (un)subscribe
                    break;
                }
                _ = shutdown.changed() => return SessionEnd::Finished,
            }
        }
    }
}

/// Bring the connection's subscriptions in line with `wanted`.
async fn sync_topics(
    pubsub: &mut PubSub,
    subscribed: &mut TopicSet,
    wanted: &TopicSet,
) -> Result<(), BusError> {
    for topic in wanted.difference(subscribed) {
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| BusError::Command(e.to_string()))?;
        info!(topic = %topic, "Subscribed to bus topic");
    }

    for topic in subscribed.difference(wanted) {
        pubsub
            .unsubscribe(topic)
            .await
            .map_err(|e| BusError::Command(e.to_string()))?;
        info!(topic = %topic, "Unsubscribed from bus topic");
    }

    subscribed.clone_from(wanted);
    Ok(())
}

/// Sleep for `delay`; returns false if shutdown arrived first.
async fn sleep_unless_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}
