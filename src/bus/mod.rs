//! Event bus integration.
//!
//! The [`EventBus`] trait is the only channel between gateway processes. It
//! is a constructed dependency: the gateway and the commit notifier receive
//! an `Arc<dyn EventBus>` instead of reaching for a process-wide client.
//!
//! ## Transports
//!
//! - [`InMemoryBus`]: in-process broadcast, used for tests and single-node runs
//! - [`RedisBus`]: Redis `PUBLISH` / `SUBSCRIBE`, shared by every gateway
//!
//! ## Subscriptions
//!
//! A subscription follows a `watch` channel holding the wanted topic set.
//! Transports subscribe to topics as they appear in the set and drop them
//! once they leave it, invoking the [`BusHandler`] once per message in the
//! order the transport delivers them.

pub mod backoff;
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use backoff::Backoff;
pub use memory::InMemoryBus;
pub use redis::RedisBus;

/// Set of topics a subscription should currently be receiving.
pub type TopicSet = BTreeSet<String>;

/// Errors raised by bus transports.
#[derive(Error, Debug)]
pub enum BusError {
    /// The transport could not be reached
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    /// The transport rejected a command
    #[error("bus command failed: {0}")]
    Command(String),

    /// The bus was closed by its owner
    #[error("bus is closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Receives messages from a bus subscription.
#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn on_message(&self, topic: &str, payload: &str);
}

/// A publish/subscribe channel keyed by topic.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Short transport name for logs ("memory", "redis")
    fn name(&self) -> &str;

    /// Hand a payload to the transport. Returns once the transport accepted
    /// it; delivery to disconnected subscribers is not guaranteed.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError>;

    /// Start delivering messages for the topics in `topics` to `handler`.
    ///
    /// The returned task runs until the topic sender is dropped or the bus
    /// is closed.
    fn subscribe(
        &self,
        topics: watch::Receiver<TopicSet>,
        handler: Arc<dyn BusHandler>,
    ) -> JoinHandle<()>;

    /// Check that the transport is reachable.
    async fn ping(&self) -> Result<(), BusError>;

    /// Stop all subscriptions and refuse further publishes.
    async fn close(&self);
}

/// How a best-effort publish ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted on the first attempt
    Published,
    /// Accepted after the single immediate retry
    Retried,
    /// Both attempts failed; the event is lost
    Dropped,
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        !matches!(self, PublishOutcome::Dropped)
    }
}

/// Publish without ever failing the caller.
///
/// Used after a write has already committed: a failed attempt is logged and
/// retried once immediately, after which the event is dropped.
pub async fn publish_with_retry(bus: &dyn EventBus, topic: &str, payload: &str) -> PublishOutcome {
    let first = match bus.publish(topic, payload).await {
        Ok(()) => {
            debug!(topic = %topic, bus = %bus.name(), "Published event");
            return PublishOutcome::Published;
        }
        Err(e) => e,
    };

    warn!(
        topic = %topic,
        bus = %bus.name(),
        error = %first,
        "Publish failed, retrying once"
    );

    match bus.publish(topic, payload).await {
        Ok(()) => PublishOutcome::Retried,
        Err(e) => {
            warn!(
                topic = %topic,
                bus = %bus.name(),
                error = %e,
                "Publish retry failed, event dropped"
            );
            PublishOutcome::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` publishes, then succeeds.
    struct FlakyBus {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyBus {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EventBus for FlakyBus {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn publish(&self, _topic: &str, _payload: &str) -> Result<(), BusError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(BusError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }

        fn subscribe(
            &self,
            _topics: watch::Receiver<TopicSet>,
            _handler: Arc<dyn BusHandler>,
        ) -> JoinHandle<()> {
            tokio::spawn(async {})
        }

        async fn ping(&self) -> Result<(), BusError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_publish_first_try() {
        let bus = FlakyBus::new(0);
        let outcome = publish_with_retry(&bus, "task-events:all", "{}").await;
        assert_eq!(outcome, PublishOutcome::Published);
        assert_eq!(bus.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_single_retry() {
        let bus = FlakyBus::new(1);
        let outcome = publish_with_retry(&bus, "task-events:all", "{}").await;
        assert_eq!(outcome, PublishOutcome::Retried);
        assert!(outcome.is_published());
        assert_eq!(bus.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_publish_dropped_after_budget() {
        let bus = FlakyBus::new(10);
        let outcome = publish_with_retry(&bus, "task-events:all", "{}").await;
        assert_eq!(outcome, PublishOutcome::Dropped);
        assert!(!outcome.is_published());
        // One attempt plus exactly one retry
        assert_eq!(bus.calls.load(Ordering::SeqCst), 2);
    }
}
