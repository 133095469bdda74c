//! DNS Cache
//!
//! Caches backend host resolution so opening a connection does not cost a
//! lookup every time. IP literals bypass the cache.

use dashmap::DashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct DnsEntry {
    addrs: Vec<SocketAddr>,
    resolved_at: Instant,
}

/// TTL cache of resolved backend addresses.
#[derive(Debug)]
pub struct DnsCache {
    ttl: Duration,
    entries: DashMap<(String, u16), DnsEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DnsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolve `host:port`, using a cached answer younger than the TTL.
    pub async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let key = (host.to_string(), port);
        if let Some(entry) = self.entries.get(&key) {
            if entry.resolved_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.addrs.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", host),
            ));
        }

        tracing::debug!(host = %host, count = addrs.len(), "resolved backend host");
        self.entries.insert(
            key,
            DnsEntry {
                addrs: addrs.clone(),
                resolved_at: Instant::now(),
            },
        );
        Ok(addrs)
    }

    /// Drop every cached answer.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}
