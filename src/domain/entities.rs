//! Domain Entities - Core business objects
//!
//! These entities represent the requests, responses and per-instance
//! runtime state the routing layer works with. They have no dependencies
//! on infrastructure.

use crate::domain::value_objects::{Algorithm, CircuitState, HealthState, InstanceId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

fn default_weight() -> u32 {
    1
}

/// Static description of a backend instance, from configuration or discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl InstanceSpec {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
        }
    }

    /// `host:port`, the instance's identity within a pool.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Static description of a backend pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub name: String,
    /// Falls back to the configured default algorithm when absent
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
    #[serde(default)]
    pub instances: Vec<InstanceSpec>,
}

/// Instance membership change reported by service discovery.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Added { pool: String, instance: InstanceSpec },
    Removed { pool: String, address: String },
}

/// Dynamic runtime state of a backend instance.
///
/// Published as one immutable value so readers never observe a
/// half-applied update. Writers build a modified copy and swap it in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceState {
    /// Result of the most recent probe threshold crossing
    pub probe_healthy: bool,
    /// Consecutive failed probes
    pub probe_failures: u32,
    /// Consecutive successful probes
    pub probe_successes: u32,
    /// Latency of the last probe
    pub last_probe_latency_ms: Option<u64>,
    /// Adaptive multiplier on the static weight
    pub weight_factor: f64,
    /// Exponential moving average of response time (0 = no data yet)
    pub avg_response_ms: f64,
    /// Exponential moving average of the success rate
    pub success_rate: f64,
    /// Requests completed against this instance
    pub total_requests: u64,
    /// Requests that failed against this instance
    pub failed_requests: u64,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self {
            probe_healthy: true,
            probe_failures: 0,
            probe_successes: 0,
            last_probe_latency_ms: None,
            weight_factor: 1.0,
            avg_response_ms: 0.0,
            success_rate: 1.0,
            total_requests: 0,
            failed_requests: 0,
        }
    }
}

/// Outcome of one forwarded call, fed back into the instance state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallOutcome {
    pub success: bool,
    pub latency: Duration,
}

impl CallOutcome {
    pub fn success(latency: Duration) -> Self {
        Self {
            success: true,
            latency,
        }
    }

    pub fn failure(latency: Duration) -> Self {
        Self {
            success: false,
            latency,
        }
    }
}

/// Read-only view of an instance for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub pool: String,
    pub address: String,
    pub weight: u32,
    pub weight_factor: f64,
    pub effective_weight: f64,
    pub health: HealthState,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub active_connections: usize,
    pub avg_response_ms: f64,
    pub success_rate: f64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub draining: bool,
}

/// An inbound request after authentication, addressed to a backend pool.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// Logical backend pool name
    pub pool: String,
    pub method: http::Method,
    /// Path forwarded to the backend, always starting with `/`
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: Option<String>,
    pub headers: http::HeaderMap,
    pub body: Bytes,
    /// Address of the original client, when known
    pub client_addr: Option<IpAddr>,
}

impl GatewayRequest {
    pub fn new(pool: impl Into<String>, method: http::Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };

        Self {
            pool: pool.into(),
            method,
            path,
            query: None,
            headers: http::HeaderMap::new(),
            body: Bytes::new(),
            client_addr: None,
        }
    }

    pub fn get(pool: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(pool, http::Method::GET, path)
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = if query.is_empty() { None } else { Some(query) };
        self
    }

    pub fn with_header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    /// Path plus query, as sent on the request line.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// Key identifying the client for hash-based balancing.
    ///
    /// Uses the client address, falling back to the first
    /// `x-forwarded-for` entry.
    pub fn client_key(&self) -> Option<String> {
        if let Some(addr) = self.client_addr {
            return Some(addr.to_string());
        }
        self.headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// A response body with headers, in the form stored by the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    /// Approximate memory footprint used for cache size accounting.
    pub fn size(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    /// Whether a response with this status may be stored.
    pub fn is_cacheable(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Forwarded from a backend instance
    Backend(InstanceId),
    /// Served from the cache without a backend call
    Cache,
    /// Shared from a concurrent fetch for the same key
    Coalesced,
}

/// Response returned by the pipeline.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl GatewayResponse {
    pub fn from_cached(cached: CachedResponse, source: ResponseSource) -> Self {
        Self {
            status: cached.status,
            headers: cached.headers,
            body: cached.body,
            source,
        }
    }

    pub fn to_cached(&self) -> CachedResponse {
        CachedResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
