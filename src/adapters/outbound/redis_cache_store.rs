//! Redis Cache Store
//!
//! Implements CacheStore on a shared Redis instance through a
//! reconnecting `ConnectionManager`. Pattern deletes iterate with SCAN,
//! never KEYS.

use crate::domain::ports::{CacheStore, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

const SCAN_BATCH: usize = 500;

/// Redis-backed shared cache tier.
#[derive(Clone)]
pub struct RedisCacheStore {
    manager: ConnectionManager,
}

impl RedisCacheStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let manager = ConnectionManager::new(client).await.map_err(unavailable)?;

        tracing::info!("connected to redis cache store");
        Ok(Self { manager })
    }
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Translate a `*`/`?` glob into a Redis MATCH pattern, escaping the
/// characters Redis would otherwise treat as syntax.
fn redis_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.manager.clone();
        conn.get::<_, Option<Vec<u8>>>(key).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds)
            .await
            .map_err(unavailable)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let removed: u64 = conn.del(key).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        let pattern = redis_pattern(pattern);
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await.map_err(unavailable)?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::debug!(pattern = %pattern, removed, "redis pattern delete");
        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_redis_pattern_escapes_brackets() {
        assert_eq!(redis_pattern("gw:content:*"), "gw:content:*");
        assert_eq!(redis_pattern("gw:a?b"), "gw:a?b");
        assert_eq!(redis_pattern("gw:[x]"), "gw:\\[x\\]");
    }

    #[tokio::test]
    async fn test_connect_failure_is_unavailable() {
        let result = RedisCacheStore::connect("redis://127.0.0.1:1/").await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_invalid_url_is_unavailable() {
        let result = RedisCacheStore::connect("not a url").await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
