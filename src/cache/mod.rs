//! Short-lived read cache.
//!
//! A [`CacheStore`] is a key/value store with per-key TTL. The
//! [`CacheCoordinator`] wraps a store and absorbs its failures: a broken
//! cache degrades into misses and no-ops, never into failed requests.
//!
//! Read-through is the caller's job (see [`crate::query::read_through`]);
//! this module only offers `get`, `set` and `invalidate`.
//!
//! # Consistency
//!
//! Once `invalidate(k)` returns, `get(k)` on the same process misses.
//! Other replicas are only guaranteed to converge by expiry, which is why
//! the default TTL is kept to a few seconds.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use memory::MemoryCache;
pub use redis::RedisCache;

/// Default time-to-live for cached reads.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Errors raised by cache stores.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache command failed: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key/value storage with expiry.
///
/// Writes replace an entry as a whole; readers never observe a partially
/// written value.
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Delete the given keys. Returns how many existed.
    async fn invalidate(&self, keys: &[String]) -> Result<usize, CacheError>;

    /// Delete every key starting with `prefix`. Returns how many existed.
    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
}

/// Failure-absorbing front for a [`CacheStore`].
#[derive(Clone)]
pub struct CacheCoordinator {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl CacheCoordinator {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a key. Store failures count as a miss.
    pub async fn get(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(Some(value)) => {
                debug!(key = %key, "Cache hit");
                Some(value)
            }
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(key = %key, cache = %self.store.name(), error = %e, "Cache get failed, treating as miss");
                None
            }
        }
    }

    /// Store a value with the default TTL.
    pub async fn set(&self, key: &str, value: &str) {
        self.set_with_ttl(key, value, self.ttl).await;
    }

    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) {
        if let Err(e) = self.store.set(key, value, ttl).await {
            warn!(key = %key, cache = %self.store.name(), error = %e, "Cache set failed");
        }
    }

    /// Drop the given keys. Returns false if the store could not be reached.
    pub async fn invalidate(&self, keys: &[String]) -> bool {
        if keys.is_empty() {
            return true;
        }

        match self.store.invalidate(keys).await {
            Ok(removed) => {
                debug!(keys = ?keys, removed = removed, "Cache invalidated");
                true
            }
            Err(e) => {
                warn!(keys = ?keys, cache = %self.store.name(), error = %e, "Cache invalidation failed");
                false
            }
        }
    }

    /// Coarse fallback: drop every key under `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) -> bool {
        match self.store.invalidate_prefix(prefix).await {
            Ok(removed) => {
                debug!(prefix = %prefix, removed = removed, "Cache prefix invalidated");
                true
            }
            Err(e) => {
                warn!(prefix = %prefix, cache = %self.store.name(), error = %e, "Cache prefix invalidation failed");
                false
            }
        }
    }
}
