//! In-process event bus.
//!
//! [`InMemoryBus`] fans every published message out to all subscriptions
//! through a `tokio::sync::broadcast` channel. Clones share the channel, so
//! several gateways built over clones of one bus behave like separate
//! processes sharing a Redis server.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BusError, BusHandler, EventBus, TopicSet};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Published {
    topic: String,
    payload: String,
}

/// Broadcast-backed bus for tests and single-process deployments.
#[derive(Clone)]
pub struct InMemoryBus {
    tx: broadcast::Sender<Published>,
    offline: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        let (shutdown, _) = watch::channel(false);
        Self {
            tx,
            offline: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Simulate the transport being unreachable: publishes fail until the
    /// bus is brought back online.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("in-memory bus is offline".into()));
        }

        // No subscribers is not an error: the message is simply not delivered
        let receivers = self
            .tx
            .send(Published {
                topic: topic.to_string(),
                payload: payload.to_string(),
            })
            .unwrap_or(0);

        debug!(topic = %topic, receivers = receivers, "In-memory publish");
        Ok(())
    }

    fn subscribe(
        &self,
        mut topics: watch::Receiver<TopicSet>,
        handler: Arc<dyn BusHandler>,
    ) -> JoinHandle<()> {
        let mut rx = self.tx.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            if closed.load(Ordering::SeqCst) {
                return;
            }
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(message) => {
                            let wanted = topics.borrow().contains(&message.topic);
                            if wanted {
                                handler.on_message(&message.topic, &message.payload).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped = skipped, "Subscriber lagged, messages lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = topics.changed() => {
                        if changed.is_err() {
                            debug!("Topic set dropped, ending subscription");
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    async fn ping(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("in-memory bus is offline".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{mpsc, Mutex};

    struct Collector {
        tx: mpsc::UnboundedSender<(String, String)>,
    }

    #[async_trait]
    impl BusHandler for Collector {
        async fn on_message(&self, topic: &str, payload: &str) {
            let _ = self.tx.send((topic.to_string(), payload.to_string()));
        }
    }

    fn topics(names: &[&str]) -> TopicSet {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn collector() -> (Arc<Collector>, mpsc::UnboundedReceiver<(String, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Collector { tx }), rx)
    }

    #[tokio::test]
    async fn test_delivers_only_wanted_topics() {
        let bus = InMemoryBus::new();
        let (handler, mut rx) = collector();
        let (_topics_tx, topics_rx) = watch::channel(topics(&["task-events:all"]));
        let _sub = bus.subscribe(topics_rx, handler);

        bus.publish("task-events:other", "skip").await.unwrap();
        bus.publish("task-events:all", "keep").await.unwrap();

        let (topic, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, "task-events:all");
        assert_eq!(payload, "keep");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_follows_topic_changes() {
        let bus = InMemoryBus::new();
        let (handler, mut rx) = collector();
        let (topics_tx, topics_rx) = watch::channel(TopicSet::new());
        let _sub = bus.subscribe(topics_rx, handler);

        bus.publish("t:a", "before").await.unwrap();
        // Let the subscription observe "before" while the set is still empty
        tokio::time::sleep(Duration::from_millis(20)).await;
        topics_tx.send_replace(topics(&["t:a"]));
        bus.publish("t:a", "after").await.unwrap();

        let (_, payload) = rx.recv().await.unwrap();
        assert_eq!(payload, "after");
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscription() {
        let bus = InMemoryBus::new();
        let (h1, mut rx1) = collector();
        let (h2, mut rx2) = collector();
        let (_t1, topics1) = watch::channel(topics(&["t:a"]));
        let (_t2, topics2) = watch::channel(topics(&["t:a"]));
        let _s1 = bus.subscribe(topics1, h1);
        let _s2 = bus.clone().subscribe(topics2, h2);

        bus.publish("t:a", "hello").await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().1, "hello");
        assert_eq!(rx2.recv().await.unwrap().1, "hello");
    }

    #[tokio::test]
    async fn test_preserves_publish_order() {
        let bus = InMemoryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        struct Recorder(Arc<Mutex<Vec<String>>>);

        #[async_trait]
        impl BusHandler for Recorder {
            async fn on_message(&self, _topic: &str, payload: &str) {
                self.0.lock().await.push(payload.to_string());
            }
        }

        let (_t, topics_rx) = watch::channel(topics(&["t:a"]));
        let _sub = bus.subscribe(topics_rx, Arc::new(Recorder(seen.clone())));

        for i in 0..20 {
            bus.publish("t:a", &i.to_string()).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.lock().await.len() < 20 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(*seen.lock().await, expected);
    }

    #[tokio::test]
    async fn test_offline_publish_fails() {
        let bus = InMemoryBus::new();
        bus.set_offline(true);
        assert!(matches!(
            bus.publish("t:a", "x").await,
            Err(BusError::Unavailable(_))
        ));
        assert!(bus.ping().await.is_err());

        bus.set_offline(false);
        assert!(bus.publish("t:a", "x").await.is_ok());
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let bus = InMemoryBus::new();
        let (handler, _rx) = collector();
        let (_t, topics_rx) = watch::channel(topics(&["t:a"]));
        let sub = bus.subscribe(topics_rx, handler);

        bus.close().await;

        tokio::time::timeout(Duration::from_secs(1), sub)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(bus.publish("t:a", "x").await, Err(BusError::Closed)));
    }
}
