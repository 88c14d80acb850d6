//! Redis-backed cache store.
//!
//! Values are written with `SET key value EX ttl`, so every entry is
//! replaced atomically and expires on the server.

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, Cmd};
use deadpool_redis::{Connection, Pool};
use std::time::Duration;
use tracing::debug;

use super::{CacheError, CacheStore};

/// Keys fetched per `SCAN` round trip during prefix invalidation.
const SCAN_BATCH: usize = 200;

/// Cache store on a shared Redis pool.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }
}

/// Redis expiry is whole seconds; never round a TTL down to "no expiry".
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn del_command(keys: &[String]) -> Cmd {
    let mut del = cmd("DEL");
    for key in keys {
        del.arg(key);
    }
    del
}

#[async_trait]
impl CacheStore for RedisCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;

        // The writer never stores empty values; treat a blank as a miss
        Ok(value.filter(|v| !v.is_empty()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: () = cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;
        Ok(())
    }

    async fn invalidate(&self, keys: &[String]) -> Result<usize, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection().await?;
        let removed: usize = del_command(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;
        Ok(removed)
    }

    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::Command(e.to_string()))?;

            if !keys.is_empty() {
                let deleted: usize = del_command(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| CacheError::Command(e.to_string()))?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, removed = removed, "Redis prefix invalidation");
        Ok(removed)
    }
}
