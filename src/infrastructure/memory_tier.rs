//! In-process (L1) cache tier
//!
//! Bounded LRU keyed by string. Entries carry an absolute expiry so an
//! entry copied from the shared tier keeps the shared tier's deadline.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

struct Slot<V> {
    value: V,
    size: usize,
    expires_at_ms: u64,
    created_at_ms: u64,
    last_access_ms: u64,
    tick: u64,
}

struct TierInner<V> {
    entries: HashMap<String, Slot<V>>,
    /// Access tick -> key, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
    bytes: usize,
    evictions: u64,
}

impl<V> TierInner<V> {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<Slot<V>> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.tick);
        self.bytes -= slot.size;
        Some(slot)
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some(slot) = self.entries.remove(&key) {
            self.bytes -= slot.size;
            self.evictions += 1;
        }
        true
    }
}

/// Metadata of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub size: usize,
    pub created_at_ms: u64,
    pub last_access_ms: u64,
    pub expires_at_ms: u64,
}

/// LRU bounded by item count and total bytes, whichever fills first.
pub struct MemoryTier<V> {
    inner: Mutex<TierInner<V>>,
    max_items: usize,
    max_bytes: usize,
}

impl<V: Clone> MemoryTier<V> {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(TierInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_tick: 0,
                bytes: 0,
                evictions: 0,
            }),
            max_items,
            max_bytes,
        }
    }

    /// Look up a live entry and mark it most recently used.
    pub fn get(&self, key: &str, now_ms: u64) -> Option<V> {
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => return None,
            Some(slot) => slot.expires_at_ms <= now_ms,
        };
        if expired {
            inner.remove(key);
            return None;
        }

        let tick = inner.bump();
        let slot = inner.entries.get_mut(key)?;
        let old_tick = std::mem::replace(&mut slot.tick, tick);
        slot.last_access_ms = now_ms;
        let value = slot.value.clone();

        inner.order.remove(&old_tick);
        inner.order.insert(tick, key.to_string());
        Some(value)
    }

    /// Store an entry, evicting least recently used ones to make room.
    ///
    /// Returns false when the entry alone exceeds the byte limit; it is
    /// not admitted and any previous value for the key is dropped.
    pub fn insert(&self, key: &str, value: V, size: usize, expires_at_ms: u64, now_ms: u64) -> bool {
        let mut inner = self.inner.lock();
        inner.remove(key);

        if size > self.max_bytes || self.max_items == 0 {
            return false;
        }

        while inner.entries.len() >= self.max_items || inner.bytes + size > self.max_bytes {
            if !inner.evict_oldest() {
                break;
            }
        }

        let tick = inner.bump();
        inner.order.insert(tick, key.to_string());
        inner.bytes += size;
        inner.entries.insert(
            key.to_string(),
            Slot {
                value,
                size,
                expires_at_ms,
                created_at_ms: now_ms,
                last_access_ms: now_ms,
                tick,
            },
        );
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Remove every key accepted by `matches`. Returns the count removed.
    pub fn remove_where<F>(&self, matches: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner.entries.keys().filter(|k| matches(k)).cloned().collect();
        for key in &doomed {
            inner.remove(key);
        }
        doomed.len()
    }

    /// Drop entries whose expiry has passed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, slot)| slot.expires_at_ms <= now_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn info(&self, key: &str) -> Option<EntryInfo> {
        self.inner.lock().entries.get(key).map(|slot| EntryInfo {
            size: slot.size,
            created_at_ms: slot.created_at_ms,
            last_access_ms: slot.last_access_ms,
            expires_at_ms: slot.expires_at_ms,
        })
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }
}
