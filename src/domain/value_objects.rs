//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Load balancing algorithm configured for a backend pool.
///
/// Exactly one algorithm is active per pool. The set is closed: every
/// variant maps to one selection function in the load balancer service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Cycle instances in registration order
    RoundRobin,
    /// Smooth weighted round robin over effective weights
    WeightedRoundRobin,
    /// Fewest active connections
    LeastConnections,
    /// Fewest active connections per unit of effective weight
    WeightedLeastConnections,
    /// Uniform random pick
    Random,
    /// Random pick proportional to effective weight
    WeightedRandom,
    /// Consistent hash of the client key
    #[serde(alias = "consistent_hash")]
    IpHash,
    /// Lowest rolling average response time
    ResponseTime,
}

impl Algorithm {
    /// Parse an algorithm name. Accepts `consistent_hash` as an alias of `ip_hash`.
    ///
    /// # Examples
    /// ```
    /// use adaptive_gateway::domain::value_objects::Algorithm;
    ///
    /// assert_eq!(Algorithm::parse("round_robin"), Some(Algorithm::RoundRobin));
    /// assert_eq!(Algorithm::parse("consistent_hash"), Some(Algorithm::IpHash));
    /// assert_eq!(Algorithm::parse("fastest"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "round_robin" => Some(Self::RoundRobin),
            "weighted_round_robin" => Some(Self::WeightedRoundRobin),
            "least_connections" => Some(Self::LeastConnections),
            "weighted_least_connections" => Some(Self::WeightedLeastConnections),
            "random" => Some(Self::Random),
            "weighted_random" => Some(Self::WeightedRandom),
            "ip_hash" | "consistent_hash" => Some(Self::IpHash),
            "response_time" => Some(Self::ResponseTime),
            _ => None,
        }
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LeastConnections => "least_connections",
            Self::WeightedLeastConnections => "weighted_least_connections",
            Self::Random => "random",
            Self::WeightedRandom => "weighted_random",
            Self::IpHash => "ip_hash",
            Self::ResponseTime => "response_time",
        }
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Self::RoundRobin
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stable handle for a backend instance.
///
/// Handles are never reused within a process, so a connection or a
/// selector can refer to an instance after it has left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health of a backend instance as seen by the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Passing probes, circuit closed
    Healthy,
    /// Failing probes; excluded from normal selection
    Unhealthy,
    /// Circuit open or instance draining; never selected
    Ejected,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Ejected => "ejected",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Circuit tripped - requests fail fast
    Open,
    /// Testing recovery - limited trial requests allowed
    HalfOpen,
}

impl Default for CircuitState {
    fn default() -> Self {
        CircuitState::Closed
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Request fingerprint used as the cache key.
///
/// Built from the pool, method, path, the query string with parameters
/// sorted, and the values of the configured vary headers. Two requests
/// that differ only in query parameter order share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(
        pool: &str,
        method: &str,
        path: &str,
        query: Option<&str>,
        vary: &[(String, String)],
    ) -> Self {
        let mut key = format!("{}:{}:{}", pool, method.to_uppercase(), path);

        if let Some(query) = query.filter(|q| !q.is_empty()) {
            let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
            params.sort_unstable();
            key.push('?');
            key.push_str(&params.join("&"));
        }

        if !vary.is_empty() {
            let mut vary: Vec<String> = vary
                .iter()
                .map(|(name, value)| format!("{}={}", name.to_lowercase(), value))
                .collect();
            vary.sort_unstable();
            key.push('|');
            key.push_str(&vary.join(";"));
        }

        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a request method may be replayed against another backend.
pub fn is_idempotent(method: &http::Method) -> bool {
    matches!(
        *method,
        http::Method::GET
            | http::Method::HEAD
            | http::Method::OPTIONS
            | http::Method::PUT
            | http::Method::DELETE
            | http::Method::TRACE
    )
}
