//! Connection Pool
//!
//! Maintains persistent HTTP/1.1 connections to backend instances for
//! reduced latency. Capacity is tracked with semaphore permits: every live
//! connection, idle or borrowed, holds one per-host and one global permit,
//! so destroying a connection frees its capacity immediately.

use crate::domain::errors::GatewayError;
use crate::domain::value_objects::InstanceId;
use crate::infrastructure::dns_cache::DnsCache;
use crate::infrastructure::registry::BackendInstance;
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Request body type sent to backends.
pub type BackendBody = Full<Bytes>;

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum connections across all backends
    pub max_connections: usize,
    /// Maximum connections per backend instance
    pub max_connections_per_host: usize,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Maximum time a connection can be idle
    pub idle_timeout: Duration,
    /// Interval between idle eviction passes
    pub keep_alive_interval: Duration,
    /// How long resolved addresses are reused
    pub dns_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_connections_per_host: 10,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(90),
            keep_alive_interval: Duration::from_secs(30),
            dns_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    destroyed: AtomicU64,
    exhausted: AtomicU64,
}

/// A live backend connection.
struct Connection {
    sender: SendRequest<BackendBody>,
    created_at: Instant,
    idle_since: Instant,
    host_permit: Option<OwnedSemaphorePermit>,
    global_permit: Option<OwnedSemaphorePermit>,
    released: Arc<Notify>,
    counters: Arc<PoolCounters>,
}

impl Connection {
    fn is_idle_expired(&self, idle_timeout: Duration) -> bool {
        self.idle_since.elapsed() > idle_timeout
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Free capacity before waking waiters so they can claim it
        self.host_permit.take();
        self.global_permit.take();
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        self.released.notify_waiters();
    }
}

#[derive(Default)]
struct HostIdle {
    conns: Vec<Connection>,
    /// Set once the host has been dropped from the pool map
    retired: bool,
}

/// Per-instance connection pool.
struct HostPool {
    instance: Arc<BackendInstance>,
    permits: Arc<Semaphore>,
    idle: Mutex<HostIdle>,
}

impl HostPool {
    /// Pop the most recently used idle connection that is still usable.
    fn take_idle(&self, idle_timeout: Duration) -> Option<Connection> {
        let mut idle = self.idle.lock();
        while let Some(conn) = idle.conns.pop() {
            if conn.is_closed() || conn.is_idle_expired(idle_timeout) {
                tracing::debug!("discarding stale connection to {}", self.instance.address());
                continue;
            }
            return Some(conn);
        }
        None
    }
}

struct PoolInner {
    config: PoolConfig,
    hosts: DashMap<InstanceId, Arc<HostPool>>,
    global: Arc<Semaphore>,
    released: Arc<Notify>,
    dns: DnsCache,
    counters: Arc<PoolCounters>,
}

/// A connection borrowed by exactly one request.
///
/// Hand it back with [`ConnectionPool::release`]. Dropping it instead
/// (for example when the request is cancelled) destroys the connection.
pub struct PooledConnection {
    conn: Option<Connection>,
    instance: Arc<BackendInstance>,
    host: Arc<HostPool>,
    poisoned: bool,
    reused: bool,
}

impl PooledConnection {
    pub fn instance(&self) -> &Arc<BackendInstance> {
        &self.instance
    }

    /// Whether this connection came from the idle set.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Mark the connection unusable; release will destroy it.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Age of the underlying connection.
    pub fn age(&self) -> Duration {
        self.conn
            .as_ref()
            .map(|c| c.created_at.elapsed())
            .unwrap_or_default()
    }

    /// Send a request and wait for the response head.
    ///
    /// A reused connection the peer already closed reports a retryable
    /// `ConnectFailure`; other failures poison the connection.
    pub async fn send(&mut self, request: http::Request<BackendBody>) -> Result<http::Response<Incoming>, GatewayError> {
        let host = self.instance.address().to_string();
        let reused = self.reused;

        let Some(conn) = self.conn.as_mut() else {
            return Err(GatewayError::Protocol {
                host,
                reason: "connection already released".to_string(),
            });
        };

        if let Err(e) = conn.sender.ready().await {
            self.poisoned = true;
            return Err(GatewayError::ConnectFailure {
                host,
                reason: e.to_string(),
            });
        }

        match conn.sender.send_request(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.poisoned = true;
                if reused && (e.is_closed() || e.is_canceled() || e.is_incomplete_message()) {
                    Err(GatewayError::ConnectFailure {
                        host,
                        reason: e.to_string(),
                    })
                } else {
                    Err(GatewayError::Protocol {
                        host,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.instance.connection_returned();
        if self.conn.take().is_some() {
            tracing::debug!("destroyed unreleased connection to {}", self.instance.address());
        }
    }
}

/// Connection pool manager.
///
/// Maintains pools of persistent connections to backend instances.
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a new connection pool.
    pub fn new(config: PoolConfig) -> Self {
        let dns = DnsCache::new(config.dns_ttl);
        Self {
            inner: Arc::new(PoolInner {
                global: Arc::new(Semaphore::new(config.max_connections)),
                hosts: DashMap::new(),
                released: Arc::new(Notify::new()),
                dns,
                counters: Arc::new(PoolCounters::default()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get or create the pool for an instance.
    fn host_pool(&self, instance: &Arc<BackendInstance>) -> Arc<HostPool> {
        self.inner
            .hosts
            .entry(instance.id())
            .or_insert_with(|| {
                Arc::new(HostPool {
                    instance: instance.clone(),
                    permits: Arc::new(Semaphore::new(self.inner.config.max_connections_per_host)),
                    idle: Mutex::new(HostIdle::default()),
                })
            })
            .clone()
    }

    fn lend(&self, host: Arc<HostPool>, conn: Connection, reused: bool) -> PooledConnection {
        host.instance.connection_borrowed();
        PooledConnection {
            conn: Some(conn),
            instance: host.instance.clone(),
            host,
            poisoned: false,
            reused,
        }
    }

    /// Acquire a connection to an instance.
    ///
    /// Reuses an idle connection when possible, else opens a new one if
    /// both the per-host and global limits allow. When only the global
    /// limit blocks, an idle connection of another host is closed to make
    /// room. Otherwise waits up to `timeout` for capacity.
    pub async fn acquire(&self, instance: &Arc<BackendInstance>, timeout: Duration) -> Result<PooledConnection, PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let host = self.host_pool(instance);

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(conn) = host.take_idle(self.inner.config.idle_timeout) {
                self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(self.lend(host, conn, true));
            }

            if let Ok(host_permit) = host.permits.clone().try_acquire_owned() {
                let global_permit = match self.inner.global.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) if self.reclaim_idle(instance.id()) => self.inner.global.clone().try_acquire_owned().ok(),
                    Err(_) => None,
                };

                if let Some(global_permit) = global_permit {
                    let conn = self.connect(instance, host_permit, global_permit).await?;
                    return Ok(self.lend(host, conn, false));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.inner.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("connection pool exhausted for {}", instance.address());
                return Err(PoolError::PoolExhausted {
                    host: instance.address().to_string(),
                });
            }
        }
    }

    /// Open a new connection and start its driver task.
    async fn connect(
        &self,
        instance: &Arc<BackendInstance>,
        host_permit: OwnedSemaphorePermit,
        global_permit: OwnedSemaphorePermit,
    ) -> Result<Connection, PoolError> {
        let address = instance.address().to_string();
        let connect_error = |reason: String| PoolError::ConnectError {
            host: address.clone(),
            reason,
        };

        let connecting = async {
            let addrs = self
                .inner
                .dns
                .resolve(instance.host(), instance.port())
                .await
                .map_err(|e| connect_error(e.to_string()))?;

            let stream = TcpStream::connect(&addrs[..])
                .await
                .map_err(|e| connect_error(e.to_string()))?;
            let _ = stream.set_nodelay(true);

            let (sender, driver) = hyper::client::conn::http1::handshake::<_, BackendBody>(TokioIo::new(stream))
                .await
                .map_err(|e| connect_error(e.to_string()))?;

            let backend = address.clone();
            tokio::spawn(async move {
                if let Err(e) = driver.await {
                    tracing::debug!("connection to {} closed with error: {}", backend, e);
                }
            });

            Ok::<_, PoolError>(sender)
        };

        let sender = match tokio::time::timeout(self.inner.config.connect_timeout, connecting).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PoolError::ConnectTimeout {
                    host: address.clone(),
                })
            }
        };

        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("opened connection to {}", address);

        let now = Instant::now();
        Ok(Connection {
            sender,
            created_at: now,
            idle_since: now,
            host_permit: Some(host_permit),
            global_permit: Some(global_permit),
            released: self.inner.released.clone(),
            counters: self.inner.counters.clone(),
        })
    }

    /// Close the oldest idle connection of any host other than `except`.
    fn reclaim_idle(&self, except: InstanceId) -> bool {
        for entry in self.inner.hosts.iter() {
            if *entry.key() == except {
                continue;
            }
            let reclaimed = {
                let mut idle = entry.value().idle.lock();
                if idle.conns.is_empty() {
                    None
                } else {
                    Some(idle.conns.remove(0))
                }
            };
            if let Some(conn) = reclaimed {
                tracing::debug!("reclaimed idle connection to {}", entry.value().instance.address());
                drop(conn);
                return true;
            }
        }
        false
    }

    /// Return a borrowed connection to the idle set.
    ///
    /// Poisoned connections, connections the peer closed, and connections
    /// of draining instances are destroyed instead.
    pub fn release(&self, mut conn: PooledConnection) {
        let Some(mut inner) = conn.conn.take() else {
            return;
        };

        if conn.poisoned || inner.is_closed() || conn.instance.is_draining() {
            tracing::debug!("destroying connection to {} on release", conn.instance.address());
            drop(inner);
            return;
        }

        inner.idle_since = Instant::now();
        let mut idle = conn.host.idle.lock();
        if idle.retired {
            drop(idle);
            drop(inner);
            return;
        }
        idle.conns.push(inner);
        drop(idle);

        self.inner.released.notify_waiters();
    }

    /// Destroy idle connections that expired, were closed by the peer, or
    /// belong to draining instances. Returns the number removed.
    pub fn evict_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let mut removed = 0;
        let mut retired = Vec::new();

        for entry in self.inner.hosts.iter() {
            let host = entry.value();
            let draining = host.instance.is_draining();

            let mut idle = host.idle.lock();
            let before = idle.conns.len();
            idle.conns
                .retain(|conn| !draining && !conn.is_closed() && !conn.is_idle_expired(idle_timeout));
            removed += before - idle.conns.len();

            if draining {
                idle.retired = true;
                retired.push(*entry.key());
            }
        }

        for id in retired {
            self.inner.hosts.remove(&id);
        }

        if removed > 0 {
            tracing::debug!("pool cleanup: removed {} idle connections", removed);
        }
        removed
    }

    /// Start periodic idle eviction every `keep_alive_interval`.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn spawn_eviction(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let pool = self.clone();
        let interval = self.inner.config.keep_alive_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.evict_idle();
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("idle eviction stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Per-instance connection counts.
    pub fn stats(&self) -> Vec<HostStats> {
        let per_host = self.inner.config.max_connections_per_host;
        let mut stats: Vec<HostStats> = self
            .inner
            .hosts
            .iter()
            .map(|entry| {
                let host = entry.value();
                let idle = host.idle.lock().conns.len();
                let total = per_host.saturating_sub(host.permits.available_permits());
                HostStats {
                    instance: *entry.key(),
                    pool: host.instance.pool().to_string(),
                    address: host.instance.address().to_string(),
                    idle,
                    active: total.saturating_sub(idle),
                    total,
                }
            })
            .collect();
        stats.sort_by_key(|s| s.instance);
        stats
    }

    /// Connection counts summed per logical pool.
    pub fn pool_totals(&self) -> HashMap<String, ConnectionCounts> {
        let mut totals: HashMap<String, ConnectionCounts> = HashMap::new();
        for host in self.stats() {
            let counts = totals.entry(host.pool).or_default();
            counts.idle += host.idle;
            counts.active += host.active;
            counts.total += host.total;
        }
        totals
    }

    /// Pool-wide counters.
    pub fn summary(&self) -> PoolSummary {
        let counters = &self.inner.counters;
        let idle = self
            .inner
            .hosts
            .iter()
            .map(|e| e.value().idle.lock().conns.len())
            .sum::<usize>();
        let total = self
            .inner
            .config
            .max_connections
            .saturating_sub(self.inner.global.available_permits());

        PoolSummary {
            idle,
            active: total.saturating_sub(idle),
            total,
            created: counters.created.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            destroyed: counters.destroyed.load(Ordering::Relaxed),
            exhausted: counters.exhausted.load(Ordering::Relaxed),
        }
    }

    /// Close every idle connection.
    pub fn clear(&self) {
        for entry in self.inner.hosts.iter() {
            entry.value().idle.lock().conns.clear();
        }
        self.inner.dns.clear();
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Connection counts for one backend instance.
#[derive(Debug, Clone, Serialize)]
pub struct HostStats {
    pub instance: InstanceId,
    pub pool: String,
    pub address: String,
    pub idle: usize,
    pub active: usize,
    pub total: usize,
}

/// Idle/active/total connection counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ConnectionCounts {
    pub idle: usize,
    pub active: usize,
    pub total: usize,
}

/// Pool-wide statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSummary {
    pub idle: usize,
    pub active: usize,
    pub total: usize,
    pub created: u64,
    pub reused: u64,
    pub destroyed: u64,
    pub exhausted: u64,
}

/// Pool errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolError {
    /// No capacity freed up within the timeout
    #[error("connection pool exhausted for {host}")]
    PoolExhausted { host: String },
    /// Connection failed
    #[error("connection error to {host}: {reason}")]
    ConnectError { host: String, reason: String },
    /// Connection timed out
    #[error("connection timeout to {host}")]
    ConnectTimeout { host: String },
}

impl From<PoolError> for GatewayError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::PoolExhausted { host } => GatewayError::PoolExhausted { host },
            PoolError::ConnectError { host, reason } => GatewayError::ConnectFailure { host, reason },
            PoolError::ConnectTimeout { host } => GatewayError::BackendTimeout { host },
        }
    }
}
