//! Prometheus Exporter
//!
//! Collects per-pool request counters from the pipeline and renders them,
//! together with registry, connection pool and cache state, in the
//! Prometheus text exposition format.

use crate::domain::entities::ResponseSource;
use crate::domain::errors::GatewayError;
use crate::domain::ports::RequestMetrics;
use crate::domain::value_objects::{CircuitState, HealthState};
use crate::infrastructure::connection_pool::ConnectionPool;
use crate::infrastructure::multi_level_cache::MultiLevelCache;
use crate::infrastructure::registry::BackendRegistry;
use dashmap::DashMap;
use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pool label used for requests naming a pool that does not exist.
pub const UNKNOWN_POOL_LABEL: &str = "_unknown";

/// Request counters for one backend pool.
#[derive(Debug, Default)]
pub struct PoolRequestMetrics {
    pub backend: AtomicU64,
    pub cache: AtomicU64,
    pub coalesced: AtomicU64,
    pub errors: AtomicU64,
    pub retries: AtomicU64,
    pub latency_sum_ms: AtomicU64,
    pub latency_count: AtomicU64,
}

impl PoolRequestMetrics {
    /// Average request latency in milliseconds.
    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.latency_sum_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    fn observe(&self, latency: Duration) {
        self.latency_sum_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Prometheus-compatible metrics exporter.
pub struct PrometheusExporter {
    pools: DashMap<String, Arc<PoolRequestMetrics>>,
    errors_by_kind: DashMap<&'static str, u64>,
}

impl PrometheusExporter {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
            errors_by_kind: DashMap::new(),
        }
    }

    fn get_or_create(&self, pool: &str) -> Arc<PoolRequestMetrics> {
        if let Some(metrics) = self.pools.get(pool) {
            return metrics.clone();
        }
        self.pools
            .entry(pool.to_string())
            .or_default()
            .clone()
    }

    pub fn pool_metrics(&self, pool: &str) -> Option<Arc<PoolRequestMetrics>> {
        self.pools.get(pool).map(|e| e.clone())
    }

    pub fn error_count(&self, kind: &str) -> u64 {
        self.errors_by_kind.get(kind).map(|e| *e).unwrap_or(0)
    }

    /// Export everything in Prometheus text format.
    pub fn export(&self, registry: &BackendRegistry, connections: &ConnectionPool, cache: &MultiLevelCache) -> String {
        let mut out = String::new();
        self.write_requests(&mut out);
        write_backends(&mut out, registry);
        write_connections(&mut out, connections);
        write_cache(&mut out, cache);
        out
    }

    fn write_requests(&self, out: &mut String) {
        let mut pools: Vec<(String, Arc<PoolRequestMetrics>)> = self
            .pools
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        pools.sort_by(|a, b| a.0.cmp(&b.0));

        header(out, "gateway_requests_total", "counter", "Requests served per pool and response source");
        for (pool, m) in &pools {
            for (source, counter) in [
                ("backend", &m.backend),
                ("cache", &m.cache),
                ("coalesced", &m.coalesced),
            ] {
                let _ = writeln!(
                    out,
                    "gateway_requests_total{{pool=\"{}\",source=\"{}\"}} {}",
                    Label(pool),
                    source,
                    counter.load(Ordering::Relaxed)
                );
            }
        }

        header(out, "gateway_request_errors_total", "counter", "Failed requests per pool");
        for (pool, m) in &pools {
            let _ = writeln!(
                out,
                "gateway_request_errors_total{{pool=\"{}\"}} {}",
                Label(pool),
                m.errors.load(Ordering::Relaxed)
            );
        }

        header(out, "gateway_retries_total", "counter", "Retried attempts per pool");
        for (pool, m) in &pools {
            let _ = writeln!(
                out,
                "gateway_retries_total{{pool=\"{}\"}} {}",
                Label(pool),
                m.retries.load(Ordering::Relaxed)
            );
        }

        header(out, "gateway_request_duration_avg_ms", "gauge", "Average request latency per pool");
        for (pool, m) in &pools {
            let _ = writeln!(
                out,
                "gateway_request_duration_avg_ms{{pool=\"{}\"}} {:.2}",
                Label(pool),
                m.avg_latency_ms()
            );
        }

        let mut kinds: Vec<(&'static str, u64)> = self.errors_by_kind.iter().map(|e| (*e.key(), *e.value())).collect();
        kinds.sort();
        header(out, "gateway_errors_by_kind_total", "counter", "Failed requests by error kind");
        for (kind, count) in kinds {
            let _ = writeln!(out, "gateway_errors_by_kind_total{{kind=\"{}\"}} {}", kind, count);
        }
    }
}

impl RequestMetrics for PrometheusExporter {
    fn record_response(&self, pool: &str, source: ResponseSource, latency: Duration) {
        let metrics = self.get_or_create(pool);
        let counter = match source {
            ResponseSource::Backend(_) => &metrics.backend,
            ResponseSource::Cache => &metrics.cache,
            ResponseSource::Coalesced => &metrics.coalesced,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics.observe(latency);
    }

    fn record_error(&self, pool: &str, error: &GatewayError, latency: Duration) {
        // Client-chosen names must not mint new series.
        let pool = match error {
            GatewayError::UnknownPool { .. } => UNKNOWN_POOL_LABEL,
            _ => pool,
        };
        let metrics = self.get_or_create(pool);
        metrics.errors.fetch_add(1, Ordering::Relaxed);
        metrics.observe(latency);
        *self.errors_by_kind.entry(error.kind()).or_insert(0) += 1;
    }

    fn record_retry(&self, pool: &str) {
        self.get_or_create(pool)
            .retries
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Label value escaped for the text exposition format.
struct Label<'a>(&'a str);

impl fmt::Display for Label<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '\\' => f.write_str("\\\\")?,
                '"' => f.write_str("\\\"")?,
                '\n' => f.write_str("\\n")?,
                c => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

fn circuit_value(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

fn write_backends(out: &mut String, registry: &BackendRegistry) {
    let pools = registry.pool_snapshots();
    let instances: Vec<_> = pools.iter().flat_map(|p| p.instances.iter()).collect();

    type Gauge = fn(&crate::domain::entities::InstanceSnapshot) -> f64;
    let gauges: [(&str, &str, Gauge); 6] = [
        ("gateway_backend_healthy", "1 if the instance is selectable by health", |i| {
            f64::from(u8::from(i.health == HealthState::Healthy))
        }),
        ("gateway_backend_circuit_state", "Circuit state (0 closed, 1 half-open, 2 open)", |i| {
            f64::from(circuit_value(i.circuit))
        }),
        ("gateway_backend_weight_factor", "Adaptive weight multiplier", |i| i.weight_factor),
        ("gateway_backend_active_connections", "Connections currently borrowed", |i| {
            i.active_connections as f64
        }),
        ("gateway_backend_response_avg_ms", "Moving average response time", |i| i.avg_response_ms),
        ("gateway_backend_success_rate", "Moving average success rate", |i| i.success_rate),
    ];

    for (name, help, value) in gauges {
        header(out, name, "gauge", help);
        for instance in &instances {
            let _ = writeln!(
                out,
                "{}{{pool=\"{}\",instance=\"{}\"}} {}",
                name,
                Label(&instance.pool),
                Label(&instance.address),
                value(instance)
            );
        }
    }

    header(out, "gateway_backend_requests_total", "counter", "Requests completed per instance");
    for instance in &instances {
        let _ = writeln!(
            out,
            "gateway_backend_requests_total{{pool=\"{}\",instance=\"{}\"}} {}",
            Label(&instance.pool),
            Label(&instance.address),
            instance.total_requests
        );
    }
}

fn write_connections(out: &mut String, connections: &ConnectionPool) {
    let mut totals: Vec<_> = connections.pool_totals().into_iter().collect();
    totals.sort_by(|a, b| a.0.cmp(&b.0));

    header(out, "gateway_pool_connections", "gauge", "Backend connections per pool");
    for (pool, counts) in totals {
        let _ = writeln!(out, "gateway_pool_connections{{pool=\"{}\",state=\"idle\"}} {}", Label(&pool), counts.idle);
        let _ = writeln!(out, "gateway_pool_connections{{pool=\"{}\",state=\"active\"}} {}", Label(&pool), counts.active);
    }

    let summary = connections.summary();
    header(out, "gateway_connections_created_total", "counter", "Backend connections opened");
    let _ = writeln!(out, "gateway_connections_created_total {}", summary.created);
    header(out, "gateway_connections_reused_total", "counter", "Idle connections reused");
    let _ = writeln!(out, "gateway_connections_reused_total {}", summary.reused);
    header(out, "gateway_connection_pool_exhausted_total", "counter", "Acquire attempts that timed out");
    let _ = writeln!(out, "gateway_connection_pool_exhausted_total {}", summary.exhausted);
}

fn write_cache(out: &mut String, cache: &MultiLevelCache) {
    let stats = cache.stats();

    header(out, "gateway_cache_hits_total", "counter", "Cache hits per level");
    let _ = writeln!(out, "gateway_cache_hits_total{{level=\"l1\"}} {}", stats.l1_hits);
    let _ = writeln!(out, "gateway_cache_hits_total{{level=\"l2\"}} {}", stats.l2_hits);

    for (name, help, value) in [
        ("gateway_cache_misses_total", "Cache misses", stats.misses),
        ("gateway_cache_loads_total", "Backend loads on miss", stats.loads),
        ("gateway_cache_shared_waits_total", "Requests served by another request's load", stats.shared_waits),
        ("gateway_cache_stores_total", "Entries written", stats.stores),
        ("gateway_cache_evictions_total", "Memory tier evictions", stats.evictions),
        ("gateway_cache_l2_errors_total", "Absorbed shared tier errors", stats.l2_errors),
    ] {
        header(out, name, "counter", help);
        let _ = writeln!(out, "{} {}", name, value);
    }

    header(out, "gateway_cache_memory_items", "gauge", "Entries in the memory tier");
    let _ = writeln!(out, "gateway_cache_memory_items {}", stats.l1_items);
    header(out, "gateway_cache_memory_bytes", "gauge", "Bytes in the memory tier");
    let _ = writeln!(out, "gateway_cache_memory_bytes {}", stats.l1_bytes);
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemoryCacheStore;
    use crate::domain::entities::InstanceSpec;
    use crate::domain::value_objects::InstanceId;
    use crate::infrastructure::clock::SystemClock;
    use crate::infrastructure::multi_level_cache::CacheSettings;
    use crate::infrastructure::registry::RegistryConfig;

    fn fixtures() -> (BackendRegistry, ConnectionPool, MultiLevelCache) {
        let registry = BackendRegistry::new(RegistryConfig::default(), Arc::new(SystemClock));
        registry.add_instance("users", &InstanceSpec::new("10.0.0.1", 8080, 1));
        let cache = MultiLevelCache::new(
            CacheSettings::default(),
            vec![],
            Arc::new(MemoryCacheStore::new()),
            Arc::new(SystemClock),
        );
        (registry, ConnectionPool::default(), cache)
    }

    #[test]
    fn test_record_response_by_source() {
        let exporter = PrometheusExporter::new();
        exporter.record_response("users", ResponseSource::Backend(InstanceId(1)), Duration::from_millis(10));
        exporter.record_response("users", ResponseSource::Cache, Duration::from_millis(2));
        exporter.record_response("users", ResponseSource::Coalesced, Duration::from_millis(6));

        let m = exporter.pool_metrics("users").unwrap();
        assert_eq!(m.backend.load(Ordering::Relaxed), 1);
        assert_eq!(m.cache.load(Ordering::Relaxed), 1);
        assert_eq!(m.coalesced.load(Ordering::Relaxed), 1);
        assert!((m.avg_latency_ms() - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_error_by_kind() {
        let exporter = PrometheusExporter::new();
        let err = GatewayError::NoHealthyBackend { pool: "users".into() };
        exporter.record_error("users", &err, Duration::from_millis(1));
        exporter.record_error("users", &err, Duration::from_millis(1));
        exporter.record_retry("users");

        assert_eq!(exporter.error_count(err.kind()), 2);
        let m = exporter.pool_metrics("users").unwrap();
        assert_eq!(m.errors.load(Ordering::Relaxed), 2);
        assert_eq!(m.retries.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_export_format() {
        let (registry, connections, cache) = fixtures();
        let exporter = PrometheusExporter::new();
        exporter.record_response("users", ResponseSource::Cache, Duration::from_millis(1));

        let output = exporter.export(&registry, &connections, &cache);

        assert!(output.contains("# TYPE gateway_requests_total counter"));
        assert!(output.contains("gateway_requests_total{pool=\"users\",source=\"cache\"} 1"));
        assert!(output.contains("gateway_backend_healthy{pool=\"users\",instance=\"10.0.0.1:8080\"} 1"));
        assert!(output.contains("gateway_backend_circuit_state{pool=\"users\",instance=\"10.0.0.1:8080\"} 0"));
        assert!(output.contains("gateway_cache_hits_total{level=\"l1\"} 0"));
        assert!(output.contains("gateway_connections_created_total 0"));
    }

    #[test]
    fn test_unknown_pools_share_one_series() {
        let (registry, connections, cache) = fixtures();
        let exporter = PrometheusExporter::new();
        for i in 0..100 {
            let pool = format!("nope-{}", i);
            let err = GatewayError::UnknownPool { pool: pool.clone() };
            exporter.record_error(&pool, &err, Duration::from_millis(1));
        }

        assert!(exporter.pool_metrics("nope-7").is_none());
        let unknown = exporter.pool_metrics(UNKNOWN_POOL_LABEL).unwrap();
        assert_eq!(unknown.errors.load(Ordering::Relaxed), 100);

        let output = exporter.export(&registry, &connections, &cache);
        let series = output
            .lines()
            .filter(|l| l.starts_with("gateway_request_errors_total{"))
            .count();
        assert_eq!(series, 1);
    }

    #[test]
    fn test_label_values_escaped() {
        let (registry, connections, cache) = fixtures();
        registry.add_instance("a\"b\\c\nd", &InstanceSpec::new("10.0.0.2", 8080, 1));
        let exporter = PrometheusExporter::new();
        let crafted = "x\"} 1\nfake_injected_metric 999\n#";
        exporter.record_response(crafted, ResponseSource::Cache, Duration::from_millis(1));

        let output = exporter.export(&registry, &connections, &cache);

        assert!(!output.lines().any(|l| l.starts_with("fake_injected_metric")));
        assert!(output.contains(
            "gateway_requests_total{pool=\"x\\\"} 1\\nfake_injected_metric 999\\n#\",source=\"cache\"} 1"
        ));
        assert!(output.contains("gateway_backend_healthy{pool=\"a\\\"b\\\\c\\nd\",instance=\"10.0.0.2:8080\"} 1"));
        for line in output.lines().filter(|l| !l.starts_with('#')) {
            assert!(line.starts_with("gateway_"), "unexpected line {:?}", line);
        }
    }

    #[test]
    fn test_export_empty() {
        let registry = BackendRegistry::new(RegistryConfig::default(), Arc::new(SystemClock));
        let cache = MultiLevelCache::new(
            CacheSettings::default(),
            vec![],
            Arc::new(MemoryCacheStore::new()),
            Arc::new(SystemClock),
        );
        let output = PrometheusExporter::new().export(&registry, &ConnectionPool::default(), &cache);
        assert!(output.contains("# HELP gateway_requests_total"));
        assert!(!output.contains("pool=\""));
    }
}
