//! Active Health Checker
//!
//! Performs periodic health checks on backend instances via TCP or HTTP
//! probes and feeds the results into the [`BackendRegistry`]. Every tick
//! also gives each pool a chance to recompute its weight factors.

use crate::infrastructure::registry::{BackendInstance, BackendRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

/// Health check configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between health checks
    pub interval: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
    /// Type of health check
    pub check_type: HealthCheckType,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            check_type: HealthCheckType::Tcp,
        }
    }
}

/// Type of health check probe.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthCheckType {
    /// Simple TCP connection check
    Tcp,
    /// HTTP GET request (expects 2xx response)
    Http { path: String },
}

/// Result of a health check.
#[derive(Debug, Clone)]
pub enum HealthCheckResult {
    Success { latency: Duration },
    Failure { error: String, latency: Duration },
}

impl HealthCheckResult {
    pub fn is_success(&self) -> bool {
        matches!(self, HealthCheckResult::Success { .. })
    }

    pub fn latency(&self) -> Duration {
        match self {
            HealthCheckResult::Success { latency } | HealthCheckResult::Failure { latency, .. } => *latency,
        }
    }
}

/// Active health checker for registry instances.
#[derive(Clone)]
pub struct HealthChecker {
    config: HealthCheckConfig,
    registry: Arc<BackendRegistry>,
    client: reqwest::Client,
}

impl HealthChecker {
    /// Create a new health checker.
    pub fn new(config: HealthCheckConfig, registry: Arc<BackendRegistry>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(1)
            .build()
            .unwrap_or_default();

        Self {
            config,
            registry,
            client,
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Start the health check loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let checker = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(checker.config.interval);
            tracing::info!(
                interval_secs = checker.config.interval.as_secs(),
                "health checker started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        checker.run_once().await;
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("health checker stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Probe every registered instance concurrently, record the results,
    /// then let each pool adjust its weights. Returns the number probed.
    pub async fn run_once(&self) -> usize {
        let instances = self.registry.all_instances();
        let count = instances.len();

        let mut probes = JoinSet::new();
        for instance in instances {
            let checker = self.clone();
            probes.spawn(async move {
                let result = checker.check_instance(&instance).await;
                (instance, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((instance, result)) => self.record(&instance, &result),
                Err(e) => tracing::warn!("health probe task failed: {}", e),
            }
        }

        for pool in self.registry.pool_names() {
            self.registry.maybe_adjust_weights(&pool);
        }
        count
    }

    fn record(&self, instance: &Arc<BackendInstance>, result: &HealthCheckResult) {
        if let HealthCheckResult::Failure { error, .. } = result {
            tracing::debug!(instance = %instance.address(), error = %error, "health probe failed");
        }
        self.registry
            .record_probe(instance, result.is_success(), result.latency());
    }

    /// Perform a single health check on an instance.
    pub async fn check_instance(&self, instance: &BackendInstance) -> HealthCheckResult {
        let start = Instant::now();

        let result = match &self.config.check_type {
            HealthCheckType::Tcp => Self::tcp_check(instance.address(), self.config.timeout).await,
            HealthCheckType::Http { path } => self.http_check(instance.address(), path).await,
        };

        let latency = start.elapsed();
        match result {
            Ok(()) => HealthCheckResult::Success { latency },
            Err(error) => HealthCheckResult::Failure { error, latency },
        }
    }

    /// TCP connection check.
    async fn tcp_check(addr: &str, timeout: Duration) -> Result<(), String> {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                let _ = stream.shutdown().await;
                Ok(())
            }
            Ok(Err(e)) => Err(format!("connection failed: {}", e)),
            Err(_) => Err("connection timeout".to_string()),
        }
    }

    /// HTTP health check.
    async fn http_check(&self, addr: &str, path: &str) -> Result<(), String> {
        let url = format!("http://{}{}", addr, path);

        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("unhealthy status: {}", resp.status())),
            Err(e) if e.is_timeout() => Err("request timeout".to_string()),
            Err(e) => Err(format!("request failed: {}", e)),
        }
    }
}
