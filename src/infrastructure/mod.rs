//! Infrastructure Layer
//!
//! Runtime machinery behind the gateway: registry, connection pool,
//! cache tiers, health probing, hot reload and shutdown.

pub mod circuit_breaker;
pub mod clock;
pub mod config_watcher;
pub mod connection_pool;
pub mod dns_cache;
pub mod health_checker;
pub mod memory_tier;
pub mod multi_level_cache;
pub mod registry;
pub mod shutdown;
pub mod single_flight;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitPermit};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config_watcher::{ConfigChange, ConfigWatchError, ConfigWatcher, HotValue};
pub use connection_pool::{ConnectionPool, PoolConfig, PoolError, PoolSummary, PooledConnection};
pub use health_checker::{HealthCheckConfig, HealthCheckResult, HealthCheckType, HealthChecker};
pub use multi_level_cache::{CacheRule, CacheSettings, CacheStats, Invalidation, MultiLevelCache};
pub use registry::{BackendInstance, BackendRegistry, RegistryConfig};
pub use shutdown::{shutdown_signal, RequestGuard, ShutdownController};
pub use single_flight::{Flight, SingleFlight};
