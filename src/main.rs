//! Adaptive Gateway - HTTP gateway with hexagonal architecture
//!
//! This is the composition root that wires together all the components.

use adaptive_gateway::adapters::inbound::{AdminServer, AdminState, GatewayServer};
use adaptive_gateway::adapters::outbound::{MemoryCacheStore, PrometheusExporter, RedisCacheStore};
use adaptive_gateway::application::{CacheWarmer, GatewayService};
use adaptive_gateway::config::{config_path, load_config, Config};
use adaptive_gateway::domain::ports::CacheStore;
use adaptive_gateway::infrastructure::{
    shutdown_signal, BackendRegistry, ConfigChange, ConfigWatcher, ConnectionPool, HealthChecker, MultiLevelCache,
    ShutdownController, SystemClock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment and optional config file
    let cfg = load_config()?;

    // Setup logging
    let default_level = if cfg.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting adaptive-gateway listen={} admin={} pools={}",
        cfg.listen_addr,
        cfg.admin_listen_addr,
        cfg.pools.len()
    );

    // ===== COMPOSITION ROOT =====

    let clock = Arc::new(SystemClock);
    let shutdown = ShutdownController::new();

    // 1. Outbound adapters and infrastructure
    let registry = Arc::new(BackendRegistry::with_pools(
        cfg.balancer.registry_config(),
        clock.clone(),
        &cfg.pools,
    ));
    let connections = ConnectionPool::new(cfg.pool.pool_config());

    let l2: Arc<dyn CacheStore> = match &cfg.cache.l2_url {
        Some(url) => match RedisCacheStore::connect(url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!("redis cache unavailable, using in-process store: {}", e);
                Arc::new(MemoryCacheStore::new())
            }
        },
        None => Arc::new(MemoryCacheStore::new()),
    };
    let cache = Arc::new(MultiLevelCache::new(
        cfg.cache.settings(),
        cfg.cache.compile_rules()?,
        l2,
        clock,
    ));
    let exporter = Arc::new(PrometheusExporter::new());

    // 2. Application services
    let service = Arc::new(GatewayService::new(
        registry.clone(),
        connections.clone(),
        cache.clone(),
        exporter.clone(),
        cfg.pipeline_config(),
    ));
    let warmer = Arc::new(CacheWarmer::new(
        service.clone(),
        cfg.cache.warm.clone(),
        cfg.cache.warm_interval(),
        cfg.cache.warm_ahead(),
    ));

    // 3. Background loops
    HealthChecker::new(cfg.balancer.health_check_config(), registry.clone()).start(shutdown.subscribe());
    connections.spawn_eviction(shutdown.subscribe());
    cache.spawn_purge(CACHE_PURGE_INTERVAL, shutdown.subscribe());
    warmer.clone().start(shutdown.subscribe());

    if let Some(path) = config_path() {
        let watcher = Arc::new(ConfigWatcher::new(&path, cfg.clone(), cfg.config_poll_interval())?);
        spawn_reload_handler(watcher.subscribe(), &registry, &cache, &warmer, shutdown.subscribe());
        watcher.start(shutdown.subscribe());
        tracing::info!(?path, "watching configuration file");
    }

    tokio::spawn(shutdown_signal(shutdown.clone()));

    // 4. Inbound adapters
    let gateway = GatewayServer::new(cfg.listen_addr.clone(), service.clone(), shutdown.clone());
    let admin = AdminServer::new(
        cfg.admin_listen_addr.clone(),
        AdminState::new(service, exporter),
        shutdown.clone(),
    );

    run_until_drained(&cfg, &shutdown, async { tokio::try_join!(gateway.run(), admin.run()) }).await?;

    connections.clear();
    tracing::info!("adaptive-gateway stopped");
    Ok(())
}

/// Drive the servers; once shutdown starts, give in-flight requests the
/// configured grace period.
async fn run_until_drained<F>(cfg: &Config, shutdown: &ShutdownController, servers: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = anyhow::Result<((), ())>>,
{
    let grace = cfg.shutdown_grace();
    let expired = async {
        shutdown.wait_for_shutdown().await;
        let drained = shutdown.wait_for_drain(grace).await;
        // Idle keep-alive client connections can hold the listeners open.
        tokio::time::sleep(Duration::from_secs(1)).await;
        drained
    };

    tokio::select! {
        result = servers => {
            result?;
        }
        drained = expired => {
            if drained {
                tracing::info!("in-flight requests drained");
            } else {
                tracing::warn!(in_flight = shutdown.in_flight(), "shutdown grace period elapsed");
            }
        }
    }
    Ok(())
}

/// Apply reloaded configuration: reconcile pools, swap cache rules and
/// warm targets.
fn spawn_reload_handler(
    mut changes: broadcast::Receiver<ConfigChange>,
    registry: &Arc<BackendRegistry>,
    cache: &Arc<MultiLevelCache>,
    warmer: &Arc<CacheWarmer>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let registry = registry.clone();
    let cache = cache.clone();
    let warmer = warmer.clone();

    tokio::spawn(async move {
        loop {
            let change = tokio::select! {
                change = changes.recv() => change,
                _ = shutdown.recv() => break,
            };

            match change {
                Ok(ConfigChange::Reloaded(new)) => {
                    registry.reconcile(&new.pools);
                    match new.cache.compile_rules() {
                        Ok(rules) => cache.replace_rules(rules),
                        Err(e) => tracing::warn!("cache rules not replaced: {}", e),
                    }
                    warmer.replace_targets(new.cache.warm.clone());
                }
                Ok(ConfigChange::Rejected(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("config reload handler lagged by {} changes", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
