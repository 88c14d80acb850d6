//! Post-commit notification for the mutation handler.
//!
//! After a write commits, the handler calls [`CommitNotifier::notify`] with
//! the resulting [`MutationEvent`]. The notifier performs two independent
//! steps:
//!
//! 1. publish the event on the bus topic for the target room
//! 2. invalidate every cached list that could contain the task, or every
//!    list when that set is unknown (a move or delete without the prior
//!    version of the task)
//!
//! Neither step can fail the write. Failures are logged and reported in the
//! returned [`NotifyReport`]; the gap they leave is closed by cache expiry
//! and client refetches.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::{publish_with_retry, EventBus, PublishOutcome};
use crate::cache::{CacheCoordinator, CacheStore};
use crate::config::SwitchboardConfig;
use crate::event::{BusMessage, MutationEvent};
use crate::gateway::{topic_for_room, DEFAULT_ROOM, DEFAULT_TOPIC_PREFIX};
use crate::query::{affected_keys_for_event, DEFAULT_KEY_PREFIX};
use crate::task::Task;

/// What happened to each post-commit step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyReport {
    pub topic: String,
    pub publish: PublishOutcome,
    pub invalidated_keys: Vec<String>,
    pub cache_ok: bool,
}

impl NotifyReport {
    /// True when both the publish and the invalidation went through.
    pub fn is_complete(&self) -> bool {
        self.publish.is_published() && self.cache_ok
    }
}

/// Publishes committed mutations and invalidates the caches they touch.
#[derive(Clone)]
pub struct CommitNotifier {
    bus: Arc<dyn EventBus>,
    cache: CacheCoordinator,
    topic_prefix: String,
    room: String,
    key_prefix: String,
    coarse_invalidation: bool,
}

impl CommitNotifier {
    pub fn new(bus: Arc<dyn EventBus>, cache: CacheCoordinator) -> Self {
        Self {
            bus,
            cache,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            room: DEFAULT_ROOM.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            coarse_invalidation: false,
        }
    }

    /// Notifier using the topic, room, key prefix and TTL of `config`.
    ///
    /// With auto-join disabled the events still go to the default room.
    pub fn from_config(
        bus: Arc<dyn EventBus>,
        store: Arc<dyn CacheStore>,
        config: &SwitchboardConfig,
    ) -> Self {
        let cache = CacheCoordinator::new(store).with_ttl(config.cache.ttl());
        Self::new(bus, cache)
            .with_topic_prefix(config.gateway.topic_prefix.clone())
            .with_room(
                config
                    .gateway
                    .default_room()
                    .unwrap_or_else(|| DEFAULT_ROOM.to_string()),
            )
            .with_key_prefix(config.cache.key_prefix.clone())
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Room whose topic receives the events (default: the global room)
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Flush every list cache on each write instead of the derived keys.
    pub fn with_coarse_invalidation(mut self) -> Self {
        self.coarse_invalidation = true;
        self
    }

    pub fn topic(&self) -> String {
        topic_for_room(&self.topic_prefix, &self.room)
    }

    /// Announce a committed write.
    ///
    /// `previous` is the task as it was before the write, when known; it
    /// widens invalidation to the lists the task is leaving.
    pub async fn notify(&self, event: &MutationEvent, previous: Option<&Task>) -> NotifyReport {
        let topic = self.topic();

        let publish = match BusMessage::from_event(event).and_then(|m| serde_json::to_string(&m)) {
            Ok(payload) => publish_with_retry(self.bus.as_ref(), &topic, &payload).await,
            Err(e) => {
                warn!(event_name = %event.name(), error = %e, "Event not serializable, not published");
                PublishOutcome::Dropped
            }
        };

        let targeted = if self.coarse_invalidation {
            None
        } else {
            affected_keys_for_event(&self.key_prefix, event, previous)
        };

        let (invalidated_keys, cache_ok) = match targeted {
            Some(keys) => {
                let ok = self.cache.invalidate(&keys).await;
                (keys, ok)
            }
            None => {
                if !self.coarse_invalidation {
                    debug!(
                        event_name = %event.name(),
                        task_id = %event.task_id(),
                        "Prior version unknown, flushing all lists"
                    );
                }
                let prefix = format!("{}:", self.key_prefix);
                let ok = self.cache.invalidate_prefix(&prefix).await;
                (vec![format!("{}*", prefix)], ok)
            }
        };

        info!(
            event_name = %event.name(),
            task_id = %event.task_id(),
            topic = %topic,
            publish = ?publish,
            cache_ok = cache_ok,
            "Commit notified"
        );

        NotifyReport {
            topic,
            publish,
            invalidated_keys,
            cache_ok,
        }
    }
}
