//! Gateway Errors
//!
//! Errors surfaced by the request pipeline. Cloneable so that every waiter
//! of a coalesced fetch receives the same error.

use thiserror::Error;

/// Error returned by the gateway pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// No connection capacity freed up within the acquire timeout
    #[error("connection pool exhausted for {host}")]
    PoolExhausted { host: String },

    /// TCP connect or handshake with the backend failed
    #[error("failed to connect to {host}: {reason}")]
    ConnectFailure { host: String, reason: String },

    /// Connect or forward exceeded its deadline
    #[error("backend {host} timed out")]
    BackendTimeout { host: String },

    /// The instance's circuit is open
    #[error("circuit open for {host}")]
    CircuitOpen { host: String },

    /// No instance of the pool is currently selectable
    #[error("no healthy backend available in pool {pool}")]
    NoHealthyBackend { pool: String },

    #[error("unknown backend pool {pool}")]
    UnknownPool { pool: String },

    /// Backend answered with a 5xx status
    #[error("backend {host} returned status {status}")]
    BackendStatus { host: String, status: u16 },

    /// The backend connection broke mid-exchange
    #[error("protocol error talking to {host}: {reason}")]
    Protocol { host: String, reason: String },

    #[error("all {attempts} attempts failed, last error: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<GatewayError>,
    },
}

impl GatewayError {
    /// Whether another attempt against a different backend may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. }
                | Self::ConnectFailure { .. }
                | Self::BackendTimeout { .. }
                | Self::CircuitOpen { .. }
                | Self::BackendStatus { .. }
        )
    }

    /// HTTP status the inbound adapter should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnknownPool { .. } => 404,
            Self::BackendTimeout { .. } => 504,
            Self::PoolExhausted { .. }
            | Self::CircuitOpen { .. }
            | Self::NoHealthyBackend { .. } => 503,
            Self::ConnectFailure { .. } | Self::Protocol { .. } => 502,
            Self::BackendStatus { status, .. } => *status,
            Self::RetriesExhausted { last, .. } => match last.status_code() {
                status if (500..600).contains(&status) && !matches!(**last, Self::BackendStatus { .. }) => status,
                _ => 502,
            },
        }
    }

    /// Short label used in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::ConnectFailure { .. } => "connect_failure",
            Self::BackendTimeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NoHealthyBackend { .. } => "no_healthy_backend",
            Self::UnknownPool { .. } => "unknown_pool",
            Self::BackendStatus { .. } => "backend_status",
            Self::Protocol { .. } => "protocol",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}
