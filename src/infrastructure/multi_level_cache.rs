//! Multi-Level Response Cache
//!
//! L1 is an in-process LRU ([`MemoryTier`]); L2 is a shared
//! [`CacheStore`]. Writes go to L2 first and only then to L1, so L1 never
//! holds anything newer than L2. Entries read back from L2 keep L2's
//! absolute expiry when copied into L1.
//!
//! L2 errors and timeouts never reach callers: they are logged at `warn`
//! and the cache degrades to a miss (reads) or a bypass (writes).

use crate::domain::entities::{CachedResponse, GatewayResponse, ResponseSource};
use crate::domain::errors::GatewayError;
use crate::domain::ports::{glob_matches, is_glob, CacheStore, StoreError};
use crate::domain::value_objects::CacheKey;
use crate::infrastructure::clock::Clock;
use crate::infrastructure::memory_tier::MemoryTier;
use crate::infrastructure::single_flight::SingleFlight;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    /// TTL for rules that do not set one
    pub default_ttl: Duration,
    pub max_memory_items: usize,
    pub max_memory_bytes: usize,
    /// Payloads above this many bytes are compressed in L2
    pub compression_threshold: usize,
    /// Upper bound on any single L2 call
    pub l2_timeout: Duration,
    /// Prepended to every L2 key
    pub key_prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(300),
            max_memory_items: 10_000,
            max_memory_bytes: 64 * 1024 * 1024,
            compression_threshold: 1024,
            l2_timeout: Duration::from_millis(100),
            key_prefix: "gateway:".to_string(),
        }
    }
}

/// Admission rule: requests whose path matches `pattern` are cached.
#[derive(Debug, Clone)]
pub struct CacheRule {
    pattern: Regex,
    source: String,
    ttl: Option<Duration>,
}

impl CacheRule {
    /// Compile a rule. The pattern is anchored at the start of the path
    /// only, so `/static/` admits everything below it.
    pub fn new(pattern: &str, ttl: Option<Duration>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(&format!("^(?:{})", pattern))?,
            source: pattern.to_string(),
            ttl,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.source
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }
}

/// Stored L2 value.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    created_at_ms: u64,
    expires_at_ms: u64,
    compressed: bool,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct CacheCounters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    stores: AtomicU64,
    l2_errors: AtomicU64,
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub l2_backend: &'static str,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub loads: u64,
    pub shared_waits: u64,
    pub stores: u64,
    pub evictions: u64,
    pub l2_errors: u64,
    pub l1_items: usize,
    pub l1_bytes: usize,
    pub rules: usize,
}

/// Outcome of an invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Invalidation {
    /// Entries removed from L1
    pub removed: usize,
    /// Keys L2 reported removed, when L2 acknowledged
    pub l2_removed: Option<u64>,
}

impl Invalidation {
    /// Whether both levels acknowledged.
    pub fn ok(&self) -> bool {
        self.l2_removed.is_some()
    }
}

/// Two-level response cache with request coalescing.
pub struct MultiLevelCache {
    settings: CacheSettings,
    rules: ArcSwap<Vec<CacheRule>>,
    l1: MemoryTier<CachedResponse>,
    l2: Arc<dyn CacheStore>,
    flight: SingleFlight<Result<GatewayResponse, GatewayError>>,
    clock: Arc<dyn Clock>,
    counters: CacheCounters,
    /// Bumped by every invalidation. L1 writes that read or wrote L2
    /// under an older epoch are dropped.
    epoch: AtomicU64,
    /// Orders epoch checks and L1 writes against invalidation.
    fence: Mutex<()>,
}

impl MultiLevelCache {
    pub fn new(settings: CacheSettings, rules: Vec<CacheRule>, l2: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        tracing::info!(
            l2 = l2.name(),
            enabled = settings.enabled,
            rules = rules.len(),
            "response cache initialized"
        );

        Self {
            l1: MemoryTier::new(settings.max_memory_items, settings.max_memory_bytes),
            rules: ArcSwap::from_pointee(rules),
            flight: SingleFlight::new(),
            counters: CacheCounters::default(),
            epoch: AtomicU64::new(0),
            fence: Mutex::new(()),
            settings,
            l2,
            clock,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    // ===== Admission =====

    /// TTL to cache a request under, or `None` if it is not cacheable.
    ///
    /// Only GET and HEAD are cached; the first rule matching the path wins.
    pub fn admission_ttl(&self, method: &http::Method, path: &str) -> Option<Duration> {
        if !self.settings.enabled || (method != http::Method::GET && method != http::Method::HEAD) {
            return None;
        }
        self.rules
            .load()
            .iter()
            .find(|rule| rule.matches(path))
            .map(|rule| rule.ttl.unwrap_or(self.settings.default_ttl))
    }

    /// Swap in a new rule set.
    pub fn replace_rules(&self, rules: Vec<CacheRule>) {
        tracing::info!(rules = rules.len(), "cache rules replaced");
        self.rules.store(Arc::new(rules));
    }

    pub fn rules(&self) -> Arc<Vec<CacheRule>> {
        self.rules.load_full()
    }

    // ===== Reads =====

    /// Look up a key in L1, then L2. Records hit/miss statistics.
    pub async fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let hit = self.fetch(key).await;
        if hit.is_none() {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    async fn fetch(&self, key: &CacheKey) -> Option<CachedResponse> {
        let now = self.clock.now_ms();

        if let Some(value) = self.l1.get(key.as_str(), now) {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        let envelope = self.l2_envelope(key).await?;
        if envelope.expires_at_ms <= now {
            return None;
        }

        let value = match decode(&envelope) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "discarding undecodable cache entry");
                return None;
            }
        };

        self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
        self.insert_l1(key, value.clone(), envelope.expires_at_ms, now, epoch);
        Some(value)
    }

    async fn l2_envelope(&self, key: &CacheKey) -> Option<Envelope> {
        let raw = match self.l2_call(self.l2.get(&self.l2_key(key.as_str()))).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                self.absorb("get", &e);
                return None;
            }
        };

        match bincode::deserialize::<Envelope>(&raw) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "discarding corrupt cache envelope");
                None
            }
        }
    }

    /// Time left before a key expires, if it is cached at all.
    pub async fn remaining_ttl(&self, key: &CacheKey) -> Option<Duration> {
        let now = self.clock.now_ms();
        let expires_at_ms = match self.l1.info(key.as_str()) {
            Some(info) => info.expires_at_ms,
            None => self.l2_envelope(key).await?.expires_at_ms,
        };
        expires_at_ms
            .checked_sub(now)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    // ===== Writes =====

    /// Store a response in L2, then L1. Returns false if the write was skipped.
    pub async fn set(&self, key: &CacheKey, value: CachedResponse, ttl: Duration) -> bool {
        let now = self.clock.now_ms();
        let expires_at_ms = now.saturating_add(ttl.as_millis() as u64);

        let encoded = match encode(&value, now, expires_at_ms, self.settings.compression_threshold) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache entry could not be encoded");
                return false;
            }
        };

        let epoch = self.epoch.load(Ordering::Acquire);
        if let Err(e) = self
            .l2_call(self.l2.set(&self.l2_key(key.as_str()), encoded, ttl))
            .await
        {
            self.absorb("set", &e);
            return false;
        }

        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        self.insert_l1(key, value, expires_at_ms, now, epoch);
        true
    }

    /// Write to L1 unless an invalidation ran since `epoch` was read.
    fn insert_l1(&self, key: &CacheKey, value: CachedResponse, expires_at_ms: u64, now: u64, epoch: u64) {
        let size = value.size();
        let _fence = self.fence.lock();
        if self.epoch.load(Ordering::Acquire) != epoch {
            tracing::debug!(key = %key, "invalidated during write, memory tier skipped");
            return;
        }
        if !self.l1.insert(key.as_str(), value, size, expires_at_ms, now) {
            tracing::debug!(key = %key, size, "entry too large for memory tier");
        }
    }

    fn bump_epoch(&self) {
        let _fence = self.fence.lock();
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Remove an exact key or every key matching a glob from both levels.
    pub async fn invalidate(&self, target: &str) -> Invalidation {
        let l2_target = self.l2_key(target);

        let removed = {
            let _fence = self.fence.lock();
            self.epoch.fetch_add(1, Ordering::AcqRel);
            if is_glob(target) {
                self.l1.remove_where(|key| glob_matches(target, key))
            } else {
                usize::from(self.l1.remove(target))
            }
        };

        let l2_result = if is_glob(target) {
            self.l2_call(self.l2.delete_matching(&l2_target)).await
        } else {
            self.l2_call(self.l2.delete(&l2_target)).await.map(u64::from)
        };
        // Reads of L2 that began before the delete landed must not reach L1.
        self.bump_epoch();

        let l2_removed = match l2_result {
            Ok(count) => Some(count),
            Err(e) => {
                self.absorb("invalidate", &e);
                None
            }
        };

        tracing::info!(pattern = %target, removed, l2_removed = ?l2_removed, "cache invalidated");
        Invalidation { removed, l2_removed }
    }

    /// Drop expired L1 entries.
    pub fn purge_expired(&self) -> usize {
        self.l1.purge_expired(self.clock.now_ms())
    }

    /// Purge expired L1 entries every `interval` until shutdown.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn spawn_purge(self: &Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            tracing::debug!("purged {} expired cache entries", purged);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    // ===== Coalesced loading =====

    /// Serve from cache, or run `load` once for all concurrent callers.
    ///
    /// The leader re-checks the cache before loading and stores 2xx
    /// responses. Waiters receive the leader's result, errors included.
    pub async fn get_or_load<F, Fut>(&self, key: &CacheKey, ttl: Duration, load: F) -> Result<GatewayResponse, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<GatewayResponse, GatewayError>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(GatewayResponse::from_cached(hit, ResponseSource::Cache));
        }

        let flight = self
            .flight
            .work(key.as_str(), || async {
                if let Some(hit) = self.fetch(key).await {
                    return Ok(GatewayResponse::from_cached(hit, ResponseSource::Cache));
                }
                self.load_and_store(key, ttl, load).await
            })
            .await;

        let mut result = flight.value;
        if flight.shared {
            if let Ok(response) = &mut result {
                if matches!(response.source, ResponseSource::Backend(_)) {
                    response.source = ResponseSource::Coalesced;
                }
            }
        }
        result
    }

    /// Reload a key regardless of what is cached, coalesced with any
    /// in-flight load for the same key.
    pub async fn refresh<F, Fut>(&self, key: &CacheKey, ttl: Duration, load: F) -> Result<GatewayResponse, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<GatewayResponse, GatewayError>>,
    {
        self.flight
            .work(key.as_str(), || self.load_and_store(key, ttl, load))
            .await
            .value
    }

    async fn load_and_store<F, Fut>(&self, key: &CacheKey, ttl: Duration, load: F) -> Result<GatewayResponse, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<GatewayResponse, GatewayError>>,
    {
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        let response = load().await?;

        let cached = response.to_cached();
        if cached.is_cacheable() {
            self.set(key, cached, ttl).await;
        }
        Ok(response)
    }

    // ===== Stats =====

    pub fn stats(&self) -> CacheStats {
        let l1_hits = self.counters.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.counters.l2_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = l1_hits + l2_hits + misses;

        CacheStats {
            enabled: self.settings.enabled,
            l2_backend: self.l2.name(),
            l1_hits,
            l2_hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (l1_hits + l2_hits) as f64 / lookups as f64
            },
            loads: self.counters.loads.load(Ordering::Relaxed),
            shared_waits: self.flight.shared_waits(),
            stores: self.counters.stores.load(Ordering::Relaxed),
            evictions: self.l1.evictions(),
            l2_errors: self.counters.l2_errors.load(Ordering::Relaxed),
            l1_items: self.l1.len(),
            l1_bytes: self.l1.bytes(),
            rules: self.rules.load().len(),
        }
    }

    // ===== Helpers =====

    fn l2_key(&self, key: &str) -> String {
        format!("{}{}", self.settings.key_prefix, key)
    }

    async fn l2_call<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.settings.l2_timeout, call)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.settings.l2_timeout)))
    }

    fn absorb(&self, operation: &str, error: &StoreError) {
        self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(store = self.l2.name(), operation, error = %error, "shared cache call failed");
    }
}

fn encode(value: &CachedResponse, now_ms: u64, expires_at_ms: u64, threshold: usize) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serialize(value).map_err(|e| StoreError::Codec(e.to_string()))?;

    let (compressed, payload) = if raw.len() > threshold {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&raw)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        let deflated = encoder.finish().map_err(|e| StoreError::Codec(e.to_string()))?;
        (true, deflated)
    } else {
        (false, raw)
    };

    bincode::serialize(&Envelope {
        created_at_ms: now_ms,
        expires_at_ms,
        compressed,
        payload,
    })
    .map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode(envelope: &Envelope) -> Result<CachedResponse, StoreError> {
    if envelope.compressed {
        let mut raw = Vec::new();
        DeflateDecoder::new(envelope.payload.as_slice())
            .read_to_end(&mut raw)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        bincode::deserialize(&raw).map_err(|e| StoreError::Codec(e.to_string()))
    } else {
        bincode::deserialize(&envelope.payload).map_err(|e| StoreError::Codec(e.to_string()))
    }
}
