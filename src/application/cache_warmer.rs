//! Cache Warmer
//!
//! Periodically refreshes configured hot requests before their cache
//! entries expire, so clients keep hitting the cache.

use crate::application::gateway_service::GatewayService;
use crate::config::WarmTarget;
use crate::domain::entities::GatewayRequest;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Refreshes warm targets whose cached copy is missing or about to expire.
pub struct CacheWarmer {
    service: Arc<GatewayService>,
    targets: ArcSwap<Vec<WarmTarget>>,
    interval: Duration,
    /// Refresh entries with less than this much TTL left
    ahead: Duration,
}

impl CacheWarmer {
    pub fn new(service: Arc<GatewayService>, targets: Vec<WarmTarget>, interval: Duration, ahead: Duration) -> Self {
        Self {
            service,
            targets: ArcSwap::from_pointee(targets),
            interval,
            ahead,
        }
    }

    /// Swap in a new target list.
    pub fn replace_targets(&self, targets: Vec<WarmTarget>) {
        self.targets.store(Arc::new(targets));
    }

    pub fn targets(&self) -> Arc<Vec<WarmTarget>> {
        self.targets.load_full()
    }

    /// Refresh every due target once. Returns how many were refreshed.
    pub async fn warm_once(&self) -> usize {
        let cache = self.service.cache();
        let mut refreshed = 0;

        for target in self.targets.load().iter() {
            let mut request = GatewayRequest::get(target.pool.as_str(), target.path.as_str());
            if let Some(query) = &target.query {
                request = request.with_query(query.as_str());
            }

            let Some(ttl) = cache.admission_ttl(&request.method, &request.path) else {
                tracing::debug!(pool = %target.pool, path = %target.path, "warm target not cacheable, skipped");
                continue;
            };

            let key = self.service.cache_key(&request);
            match cache.remaining_ttl(&key).await {
                Some(left) if left > self.ahead => continue,
                _ => {}
            }

            match cache.refresh(&key, ttl, || self.service.forward(&request)).await {
                Ok(response) => {
                    refreshed += 1;
                    tracing::debug!(key = %key, status = response.status, "cache entry warmed");
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "cache warm failed"),
            }
        }
        refreshed
    }

    /// Start the warming loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let refreshed = self.warm_once().await;
                        if refreshed > 0 {
                            tracing::info!(refreshed, "cache warming pass complete");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("cache warmer stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::{MemoryCacheStore, PrometheusExporter};
    use crate::application::gateway_service::PipelineConfig;
    use crate::domain::entities::{InstanceSpec, ResponseSource};
    use crate::infrastructure::clock::{Clock, ManualClock, SystemClock};
    use crate::infrastructure::connection_pool::{ConnectionPool, PoolConfig};
    use crate::infrastructure::multi_level_cache::{CacheRule, CacheSettings, MultiLevelCache};
    use crate::infrastructure::registry::{BackendRegistry, RegistryConfig};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(backend: &MockServer) -> (Arc<GatewayService>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(BackendRegistry::new(RegistryConfig::default(), Arc::new(SystemClock)));
        registry.add_instance("content", &InstanceSpec::new("127.0.0.1", backend.address().port(), 1));

        let cache_clock: Arc<dyn Clock> = clock.clone();
        let cache = Arc::new(MultiLevelCache::new(
            CacheSettings::default(),
            vec![CacheRule::new("/content/.*", Some(Duration::from_secs(60))).unwrap()],
            Arc::new(MemoryCacheStore::with_clock(cache_clock.clone())),
            cache_clock,
        ));

        let service = Arc::new(GatewayService::new(
            registry,
            ConnectionPool::new(PoolConfig::default()),
            cache,
            Arc::new(PrometheusExporter::new()),
            PipelineConfig::default(),
        ));
        (service, clock)
    }

    fn target(path: &str) -> WarmTarget {
        WarmTarget {
            pool: "content".into(),
            path: path.into(),
            query: None,
        }
    }

    #[tokio::test]
    async fn test_warm_populates_and_skips_fresh_entries() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/content/home"))
            .respond_with(ResponseTemplate::new(200).set_body_string("home"))
            .expect(2)
            .mount(&backend)
            .await;

        let (service, clock) = setup(&backend).await;
        let warmer = CacheWarmer::new(
            service.clone(),
            vec![target("/content/home")],
            Duration::from_secs(10),
            Duration::from_secs(15),
        );

        assert_eq!(warmer.warm_once().await, 1);
        let served = service
            .handle(GatewayRequest::get("content", "/content/home"))
            .await
            .unwrap();
        assert_eq!(served.source, ResponseSource::Cache);

        // Plenty of TTL left: nothing to do.
        clock.advance(Duration::from_secs(30));
        assert_eq!(warmer.warm_once().await, 0);

        // Inside the warm-ahead window: refreshed.
        clock.advance(Duration::from_secs(20));
        assert_eq!(warmer.warm_once().await, 1);
    }

    #[tokio::test]
    async fn test_uncacheable_targets_are_skipped() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&backend)
            .await;

        let (service, _) = setup(&backend).await;
        let warmer = CacheWarmer::new(service, vec![target("/private/me")], Duration::from_secs(10), Duration::from_secs(5));

        assert_eq!(warmer.warm_once().await, 0);
    }

    #[tokio::test]
    async fn test_replace_targets() {
        let backend = MockServer::start().await;
        let (service, _) = setup(&backend).await;
        let warmer = CacheWarmer::new(service, vec![], Duration::from_secs(10), Duration::from_secs(5));

        warmer.replace_targets(vec![target("/content/a"), target("/content/b")]);
        assert_eq!(warmer.targets().len(), 2);
    }
}
