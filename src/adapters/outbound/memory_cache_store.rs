//! In-process Cache Store
//!
//! Implements CacheStore using DashMap. Used as the shared tier when no
//! Redis URL is configured, and in tests.

use crate::domain::ports::{glob_matches, CacheStore, StoreError};
use crate::infrastructure::clock::{Clock, SystemClock};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

struct StoredValue {
    value: Vec<u8>,
    expires_at_ms: u64,
}

/// DashMap-backed cache store with per-key expiry.
pub struct MemoryCacheStore {
    entries: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of stored keys, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired keys.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, v| v.expires_at_ms > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!("memory cache store purged {} expired keys", removed);
        }
        removed
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.clock.now_ms();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.expires_at_ms > now => return Ok(Some(entry.value.clone())),
            Some(_) => {}
        }
        self.entries.remove_if(key, |_, v| v.expires_at_ms <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let expires_at_ms = self.clock.now_ms().saturating_add(ttl.as_millis() as u64);
        self.entries
            .insert(key.to_string(), StoredValue { value, expires_at_ms });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !glob_matches(pattern, key));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::infrastructure::clock::ManualClock;

    fn store() -> (MemoryCacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (MemoryCacheStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (store, _) = store();
        store.set("k", b"v".to_vec(), Duration::from_secs(10)).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let (store, clock) = store();
        store.set("k", b"v".to_vec(), Duration::from_secs(10)).await.unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_matching() {
        let (store, _) = store();
        for key in ["g:users:1", "g:users:2", "g:orders:1"] {
            store.set(key, vec![], Duration::from_secs(10)).await.unwrap();
        }

        assert_eq!(store.delete_matching("g:users:*").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.delete_matching("g:?rders:1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store();
        store.set("short", vec![], Duration::from_secs(1)).await.unwrap();
        store.set("long", vec![], Duration::from_secs(100)).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
