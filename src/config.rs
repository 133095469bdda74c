use crate::application::gateway_service::PipelineConfig;
use crate::domain::entities::PoolSpec;
use crate::domain::value_objects::Algorithm;
use crate::infrastructure::circuit_breaker::CircuitBreakerConfig;
use crate::infrastructure::connection_pool::PoolConfig;
use crate::infrastructure::health_checker::{HealthCheckConfig, HealthCheckType};
use crate::infrastructure::multi_level_cache::{CacheRule, CacheSettings};
use crate::infrastructure::registry::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("cannot parse config file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid cache rule pattern {pattern:?}: {reason}")]
    InvalidRule { pattern: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_connections: usize,
    pub max_connections_per_host: usize,
    pub connect_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub keep_alive_interval_secs: u64,
    pub dns_ttl_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_connections_per_host: 10,
            connect_timeout_ms: 5_000,
            idle_timeout_secs: 90,
            keep_alive_interval_secs: 30,
            dns_ttl_secs: 60,
        }
    }
}

impl PoolSection {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            max_connections_per_host: self.max_connections_per_host,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            keep_alive_interval: Duration::from_secs(self.keep_alive_interval_secs),
            dns_ttl: Duration::from_secs(self.dns_ttl_secs),
        }
    }
}

/// Cache admission rule as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRuleSpec {
    pub pattern: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Request periodically refreshed by the cache warmer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmTarget {
    pub pool: String,
    pub path: String,
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub default_ttl_secs: u64,
    pub max_memory_items: usize,
    pub max_memory_bytes: usize,
    pub compression_threshold: usize,
    /// Redis URL for the shared tier; in-process store when absent
    pub l2_url: Option<String>,
    pub l2_timeout_ms: u64,
    pub key_prefix: String,
    pub vary_headers: Vec<String>,
    pub rules: Vec<CacheRuleSpec>,
    pub warm: Vec<WarmTarget>,
    pub warm_interval_secs: u64,
    pub warm_ahead_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 300,
            max_memory_items: 10_000,
            max_memory_bytes: 64 * 1024 * 1024,
            compression_threshold: 1024,
            l2_url: None,
            l2_timeout_ms: 100,
            key_prefix: "gateway:".to_string(),
            vary_headers: Vec::new(),
            rules: Vec::new(),
            warm: Vec::new(),
            warm_interval_secs: 60,
            warm_ahead_secs: 30,
        }
    }
}

impl CacheSection {
    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            enabled: self.enabled,
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            max_memory_items: self.max_memory_items,
            max_memory_bytes: self.max_memory_bytes,
            compression_threshold: self.compression_threshold,
            l2_timeout: Duration::from_millis(self.l2_timeout_ms),
            key_prefix: self.key_prefix.clone(),
        }
    }

    /// Compile the admission rules in order.
    pub fn compile_rules(&self) -> Result<Vec<CacheRule>, ConfigError> {
        self.rules
            .iter()
            .map(|rule| {
                CacheRule::new(&rule.pattern, rule.ttl_secs.map(Duration::from_secs)).map_err(|e| {
                    ConfigError::InvalidRule {
                        pattern: rule.pattern.clone(),
                        reason: e.to_string(),
                    }
                })
            })
            .collect()
    }

    pub fn warm_interval(&self) -> Duration {
        Duration::from_secs(self.warm_interval_secs)
    }

    pub fn warm_ahead(&self) -> Duration {
        Duration::from_secs(self.warm_ahead_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerSection {
    pub algorithm: Algorithm,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_ms: u64,
    /// HTTP probe path; TCP probe when absent
    pub health_check_path: Option<String>,
    pub health_check_failure_threshold: u32,
    pub health_check_success_threshold: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_requests: u32,
    pub min_weight_factor: f64,
    pub max_weight_factor: f64,
    pub weight_adjustment_interval_secs: u64,
}

impl Default for BalancerSection {
    fn default() -> Self {
        let registry = RegistryConfig::default();
        let circuit = CircuitBreakerConfig::default();
        Self {
            algorithm: Algorithm::default(),
            health_check_interval_secs: 10,
            health_check_timeout_ms: 5_000,
            health_check_path: None,
            health_check_failure_threshold: registry.health_failure_threshold,
            health_check_success_threshold: registry.health_success_threshold,
            failure_threshold: circuit.failure_threshold,
            success_threshold: circuit.success_threshold,
            recovery_timeout_ms: circuit.recovery_timeout.as_millis() as u64,
            half_open_max_requests: circuit.half_open_max_requests,
            min_weight_factor: registry.min_weight_factor,
            max_weight_factor: registry.max_weight_factor,
            weight_adjustment_interval_secs: registry.weight_adjustment_interval.as_secs(),
        }
    }
}

impl BalancerSection {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            default_algorithm: self.algorithm,
            circuit: CircuitBreakerConfig {
                failure_threshold: self.failure_threshold,
                success_threshold: self.success_threshold,
                recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
                half_open_max_requests: self.half_open_max_requests,
            },
            health_failure_threshold: self.health_check_failure_threshold,
            health_success_threshold: self.health_check_success_threshold,
            min_weight_factor: self.min_weight_factor,
            max_weight_factor: self.max_weight_factor,
            weight_adjustment_interval: Duration::from_secs(self.weight_adjustment_interval_secs),
            ..RegistryConfig::default()
        }
    }

    pub fn health_check_config(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_secs(self.health_check_interval_secs),
            timeout: Duration::from_millis(self.health_check_timeout_ms),
            check_type: match &self.health_check_path {
                Some(path) => HealthCheckType::Http { path: path.clone() },
                None => HealthCheckType::Tcp,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub request_timeout_ms: u64,
    pub retry_count: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            retry_count: 2,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Listeners
    pub listen_addr: String,
    pub admin_listen_addr: String,
    pub debug: bool,

    /// Config file polling interval for hot reload
    pub config_poll_secs: u64,
    /// Upper bound on waiting for in-flight requests at shutdown
    pub shutdown_grace_secs: u64,

    pub pool: PoolSection,
    pub cache: CacheSection,
    pub balancer: BalancerSection,
    pub pipeline: PipelineSection,
    pub pools: Vec<PoolSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            admin_listen_addr: "0.0.0.0:9090".to_string(),
            debug: false,
            config_poll_secs: 5,
            shutdown_grace_secs: 30,
            pool: PoolSection::default(),
            cache: CacheSection::default(),
            balancer: BalancerSection::default(),
            pipeline: PipelineSection::default(),
            pools: Vec::new(),
        }
    }
}

impl Config {
    /// Parse a JSON config file. Missing sections take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            request_timeout: Duration::from_millis(self.pipeline.request_timeout_ms),
            retry_count: self.pipeline.retry_count,
            retry_base_delay: Duration::from_millis(self.pipeline.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.pipeline.retry_max_delay_ms),
            vary_headers: self.cache.vary_headers.clone(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn config_poll_interval(&self) -> Duration {
        Duration::from_secs(self.config_poll_secs.max(1))
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.pool.max_connections == 0 || self.pool.max_connections_per_host == 0 {
            return invalid("connection limits must be greater than zero");
        }
        if self.pool.connect_timeout_ms == 0 {
            return invalid("connect_timeout_ms must be greater than zero");
        }
        if self.cache.max_memory_items == 0 || self.cache.max_memory_bytes == 0 {
            return invalid("cache memory limits must be greater than zero");
        }
        if self.balancer.failure_threshold == 0
            || self.balancer.success_threshold == 0
            || self.balancer.half_open_max_requests == 0
        {
            return invalid("circuit breaker thresholds must be greater than zero");
        }
        if self.balancer.health_check_failure_threshold == 0 || self.balancer.health_check_success_threshold == 0 {
            return invalid("health check thresholds must be greater than zero");
        }
        if !(self.balancer.min_weight_factor > 0.0 && self.balancer.min_weight_factor <= self.balancer.max_weight_factor) {
            return invalid("weight factor bounds must satisfy 0 < min_weight_factor <= max_weight_factor");
        }
        if self.pipeline.request_timeout_ms == 0 {
            return invalid("request_timeout_ms must be greater than zero");
        }
        if self.pipeline.retry_base_delay_ms > self.pipeline.retry_max_delay_ms {
            return invalid("retry_base_delay_ms must not exceed retry_max_delay_ms");
        }

        let mut names = std::collections::HashSet::new();
        for pool in &self.pools {
            if pool.name.is_empty() || !names.insert(pool.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate or empty pool name {:?}", pool.name)));
            }
            if pool.instances.iter().any(|i| i.port == 0) {
                return Err(ConfigError::Invalid(format!("pool {} has an instance with port 0", pool.name)));
            }
        }

        self.cache.compile_rules()?;
        Ok(())
    }
}

fn flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Load configuration from an optional file plus environment overrides.
///
/// `env` looks up a variable by name.
pub fn load_config_with<F>(path: Option<&Path>, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(v) = env("GATEWAY_LISTEN_ADDR") {
        cfg.listen_addr = v;
    }
    if let Some(v) = env("GATEWAY_ADMIN_LISTEN_ADDR") {
        cfg.admin_listen_addr = v;
    }
    if env("DEBUG").is_some() {
        cfg.debug = true;
    }
    if let Some(v) = env("GATEWAY_L2_URL") {
        cfg.cache.l2_url = Some(v).filter(|v| !v.is_empty());
    }
    if let Some(v) = env("GATEWAY_CACHE_ENABLED") {
        cfg.cache.enabled = flag(&v);
    }
    if let Some(algorithm) = env("GATEWAY_ALGORITHM").and_then(|v| Algorithm::parse(&v)) {
        cfg.balancer.algorithm = algorithm;
    }
    if let Some(v) = env("GATEWAY_REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        cfg.pipeline.request_timeout_ms = v;
    }
    if let Some(v) = env("GATEWAY_RETRY_COUNT").and_then(|v| v.parse().ok()) {
        cfg.pipeline.retry_count = v;
    }
    if let Some(v) = env("GATEWAY_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
        cfg.pool.max_connections = v;
    }

    cfg.validate()?;
    Ok(cfg)
}

/// Path of the JSON config file, from `GATEWAY_CONFIG_PATH`.
pub fn config_path() -> Option<PathBuf> {
    std::env::var("GATEWAY_CONFIG_PATH").ok().map(PathBuf::from)
}

pub fn load_config() -> anyhow::Result<Config> {
    let path = config_path();
    let cfg = load_config_with(path.as_deref(), |key| std::env::var(key).ok())?;
    Ok(cfg)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn write_config(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.admin_listen_addr, "0.0.0.0:9090");
        assert!(cfg.cache.enabled);
        assert!(cfg.pools.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_config_defaults() {
        let cfg = load_config_with(None, env(&[])).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_env_overrides() {
        let cfg = load_config_with(
            None,
            env(&[
                ("GATEWAY_LISTEN_ADDR", "127.0.0.1:9000"),
                ("GATEWAY_L2_URL", "redis://cache:6379"),
                ("GATEWAY_ALGORITHM", "least_connections"),
                ("GATEWAY_RETRY_COUNT", "4"),
                ("DEBUG", "1"),
            ]),
        )
        .unwrap();

        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.cache.l2_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(cfg.balancer.algorithm, Algorithm::LeastConnections);
        assert_eq!(cfg.pipeline.retry_count, 4);
        assert!(cfg.debug);
    }

    #[test]
    fn test_env_parse_error_uses_default() {
        let cfg = load_config_with(None, env(&[("GATEWAY_REQUEST_TIMEOUT_MS", "soon")])).unwrap();
        assert_eq!(cfg.pipeline.request_timeout_ms, 30_000);
    }

    #[test]
    fn test_cache_enabled_flag() {
        let cfg = load_config_with(None, env(&[("GATEWAY_CACHE_ENABLED", "FALSE")])).unwrap();
        assert!(!cfg.cache.enabled);
        let cfg = load_config_with(None, env(&[("GATEWAY_CACHE_ENABLED", "1")])).unwrap();
        assert!(cfg.cache.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"{
                "pool": { "max_connections_per_host": 4 },
                "cache": {
                    "rules": [{ "pattern": "/content/.*", "ttl_secs": 300 }, { "pattern": "/static/" }],
                    "warm": [{ "pool": "content", "path": "/content/home" }]
                },
                "balancer": { "health_check_path": "/health", "failure_threshold": 5 },
                "pools": [{
                    "name": "content",
                    "algorithm": "weighted_round_robin",
                    "instances": [{ "host": "10.0.0.1", "port": 8080, "weight": 2 }, { "host": "10.0.0.2", "port": 8080 }]
                }]
            }"#,
        );

        let cfg = load_config_with(Some(file.path()), env(&[])).unwrap();
        assert_eq!(cfg.pool.max_connections_per_host, 4);
        assert_eq!(cfg.pool.max_connections, 100);
        assert_eq!(cfg.cache.rules.len(), 2);
        assert_eq!(cfg.cache.rules[1].ttl_secs, None);
        assert_eq!(cfg.cache.warm[0].pool, "content");
        assert_eq!(cfg.pools[0].algorithm, Some(Algorithm::WeightedRoundRobin));
        assert_eq!(cfg.pools[0].instances[1].weight, 1);

        let health = cfg.balancer.health_check_config();
        assert_eq!(health.check_type, HealthCheckType::Http { path: "/health".into() });
        assert_eq!(cfg.balancer.registry_config().circuit.failure_threshold, 5);
        assert_eq!(cfg.cache.compile_rules().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_file_error() {
        let result = load_config_with(Some(Path::new("/nonexistent/gateway.json")), env(&[]));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_malformed_file_error() {
        let file = write_config("{ not json");
        let result = load_config_with(Some(file.path()), env(&[]));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut cfg = Config::default();
        cfg.pool.max_connections_per_host = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_weight_bounds() {
        let mut cfg = Config::default();
        cfg.balancer.min_weight_factor = 3.0;
        cfg.balancer.max_weight_factor = 2.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_rule() {
        let mut cfg = Config::default();
        cfg.cache.rules.push(CacheRuleSpec {
            pattern: "/content/(".into(),
            ttl_secs: None,
        });
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRule { .. })));
    }

    #[test]
    fn test_validate_rejects_duplicate_pools() {
        let mut cfg = Config::default();
        for _ in 0..2 {
            cfg.pools.push(PoolSpec {
                name: "users".into(),
                algorithm: None,
                instances: vec![],
            });
        }
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_pipeline_config_carries_vary_headers() {
        let mut cfg = Config::default();
        cfg.cache.vary_headers = vec!["accept-language".into()];
        let pipeline = cfg.pipeline_config();
        assert_eq!(pipeline.vary_headers, vec!["accept-language".to_string()]);
        assert_eq!(pipeline.request_timeout, Duration::from_secs(30));
    }
}
