//! Gateway Service - request pipeline use case
//!
//! Runs each request through cache admission, backend selection,
//! connection acquisition and forwarding, retrying idempotent requests
//! against other instances. This is the primary interface for the inbound
//! adapters and the cache warmer.

use crate::domain::entities::{CallOutcome, GatewayRequest, GatewayResponse, ResponseSource};
use crate::domain::errors::GatewayError;
use crate::domain::ports::RequestMetrics;
use crate::domain::value_objects::{is_idempotent, CacheKey, InstanceId};
use crate::infrastructure::connection_pool::{BackendBody, ConnectionPool};
use crate::infrastructure::multi_level_cache::MultiLevelCache;
use crate::infrastructure::registry::{BackendInstance, BackendRegistry};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use http::HeaderMap;
use http_body_util::{BodyExt, Full};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

/// Headers that only apply to a single transport hop.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Pipeline settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Deadline for one forwarded attempt, response body included
    pub request_timeout: Duration,
    /// Additional attempts for idempotent requests
    pub retry_count: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Request headers whose values are part of the cache key
    pub vary_headers: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retry_count: 2,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(2),
            vary_headers: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Delay before retry number `retry` (zero-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.retry_base_delay
            .checked_mul(factor)
            .unwrap_or(self.retry_max_delay)
            .min(self.retry_max_delay)
    }
}

/// Gateway service - main application use case.
pub struct GatewayService {
    registry: Arc<BackendRegistry>,
    connections: ConnectionPool,
    cache: Arc<MultiLevelCache>,
    metrics: Arc<dyn RequestMetrics>,
    config: PipelineConfig,
}

impl GatewayService {
    pub fn new(
        registry: Arc<BackendRegistry>,
        connections: ConnectionPool,
        cache: Arc<MultiLevelCache>,
        metrics: Arc<dyn RequestMetrics>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            connections,
            cache,
            metrics,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionPool {
        &self.connections
    }

    pub fn cache(&self) -> &Arc<MultiLevelCache> {
        &self.cache
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Handle one request end to end.
    ///
    /// Runs inside a span carrying a fresh request id, and reports the
    /// outcome to the metrics sink.
    pub async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let span = tracing::info_span!(
            "request",
            id = %Uuid::new_v4(),
            pool = %request.pool,
            method = %request.method,
            path = %request.path,
        );

        let started = Instant::now();
        let pool = request.pool.clone();
        let result = self.process(&request).instrument(span).await;

        match &result {
            Ok(response) => self.metrics.record_response(&pool, response.source, started.elapsed()),
            Err(e) => {
                tracing::debug!(pool = %pool, error = %e, "request failed");
                self.metrics.record_error(&pool, e, started.elapsed());
            }
        }
        result
    }

    async fn process(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        tracing::debug!("received");
        if self.registry.pool(&request.pool).is_none() {
            return Err(GatewayError::UnknownPool {
                pool: request.pool.clone(),
            });
        }

        let Some(ttl) = self.cache.admission_ttl(&request.method, &request.path) else {
            return self.forward(request).await;
        };

        let key = self.cache_key(request);
        tracing::debug!(key = %key, "cache check");
        let response = self
            .cache
            .get_or_load(&key, ttl, || self.forward(request))
            .await?;

        match response.source {
            ResponseSource::Cache => tracing::debug!(key = %key, "cache hit"),
            ResponseSource::Coalesced => tracing::debug!(key = %key, "coalesced with in-flight fetch"),
            ResponseSource::Backend(_) => tracing::debug!(key = %key, "cache populated"),
        }
        Ok(response)
    }

    /// Cache key for a request: pool, method, path, sorted query and the
    /// configured vary headers.
    pub fn cache_key(&self, request: &GatewayRequest) -> CacheKey {
        let vary: Vec<(String, String)> = self
            .config
            .vary_headers
            .iter()
            .filter_map(|name| {
                request
                    .headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .map(|v| (name.clone(), v.to_string()))
            })
            .collect();

        CacheKey::new(
            &request.pool,
            request.method.as_str(),
            &request.path,
            request.query.as_deref(),
            &vary,
        )
    }

    /// Forward a request to the pool, bypassing the cache.
    ///
    /// Idempotent requests are retried against newly selected instances
    /// with exponential backoff; instances that failed are excluded for the
    /// rest of the request.
    pub async fn forward(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let retriable = is_idempotent(&request.method);
        let max_attempts = if retriable { self.config.retry_count + 1 } else { 1 };
        let client_key = request.client_key();
        let mut excluded: Vec<InstanceId> = Vec::new();
        let mut last_error: Option<GatewayError> = None;
        let mut attempts = 0;

        while attempts < max_attempts {
            if attempts > 0 {
                let delay = self.config.backoff(attempts - 1);
                tracing::debug!(attempt = attempts + 1, delay_ms = delay.as_millis() as u64, "retrying");
                self.metrics.record_retry(&request.pool);
                tokio::time::sleep(delay).await;
            }

            let instance = match self.registry.select(&request.pool, client_key.as_deref(), &excluded) {
                Ok(instance) => instance,
                // Every remaining instance was excluded by earlier attempts.
                Err(GatewayError::NoHealthyBackend { .. }) if last_error.is_some() => break,
                Err(e) => return Err(e),
            };
            attempts += 1;
            tracing::debug!(instance = %instance.address(), attempt = attempts, "backend selected");

            let error = match self.attempt(&instance, request).await {
                Ok(response) if response.status < 500 => return Ok(response),
                Ok(response) if !retriable => return Ok(response),
                Ok(response) => GatewayError::BackendStatus {
                    host: instance.address().to_string(),
                    status: response.status,
                },
                Err(e) => e,
            };

            if !retriable || !error.is_retryable() {
                return Err(error);
            }

            tracing::debug!(instance = %instance.address(), error = %error, "attempt failed");
            excluded.push(instance.id());
            last_error = Some(error);
        }

        match last_error {
            Some(last) => Err(GatewayError::RetriesExhausted {
                attempts,
                last: Box::new(last),
            }),
            None => Err(GatewayError::NoHealthyBackend {
                pool: request.pool.clone(),
            }),
        }
    }

    /// One forwarded attempt against a chosen instance.
    ///
    /// Backend 5xx responses come back as `Ok`; the instance has already
    /// been charged with a failure.
    async fn attempt(&self, instance: &Arc<BackendInstance>, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let host = instance.address().to_string();
        let permit = instance
            .circuit()
            .try_acquire()
            .ok_or_else(|| GatewayError::CircuitOpen { host: host.clone() })?;

        let started = Instant::now();
        let mut conn = match self
            .connections
            .acquire(instance, self.connections.config().connect_timeout)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                let error = GatewayError::from(e);
                // Exhaustion is local back-pressure, not a backend fault.
                if !matches!(error, GatewayError::PoolExhausted { .. }) {
                    self.registry
                        .complete_call(instance, permit, CallOutcome::failure(started.elapsed()));
                }
                return Err(error);
            }
        };
        tracing::debug!(instance = %host, reused = conn.is_reused(), "connection acquired");

        let backend_request = match build_backend_request(instance.address(), request) {
            Ok(r) => r,
            Err(e) => {
                self.connections.release(conn);
                return Err(e);
            }
        };

        let exchange = async {
            let response = conn.send(backend_request).await?;
            let (parts, body) = response.into_parts();
            match body.collect().await {
                Ok(collected) => Ok::<_, GatewayError>((parts, collected.to_bytes())),
                Err(e) => {
                    conn.poison();
                    Err(GatewayError::Protocol {
                        host: host.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        };

        let result = match tokio::time::timeout(self.config.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                conn.poison();
                Err(GatewayError::BackendTimeout { host: host.clone() })
            }
        };
        self.connections.release(conn);

        let latency = started.elapsed();
        match result {
            Ok((parts, body)) => {
                let status = parts.status.as_u16();
                let outcome = if status >= 500 {
                    CallOutcome::failure(latency)
                } else {
                    CallOutcome::success(latency)
                };
                self.registry.complete_call(instance, permit, outcome);
                tracing::debug!(instance = %host, status, latency_ms = latency.as_millis() as u64, "forwarded");

                Ok(GatewayResponse {
                    status,
                    headers: response_headers(&parts.headers),
                    body,
                    source: ResponseSource::Backend(instance.id()),
                })
            }
            Err(e) => {
                self.registry
                    .complete_call(instance, permit, CallOutcome::failure(latency));
                Err(e)
            }
        }
    }
}

/// Header names listed in `Connection` are hop-by-hop as well.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn is_hop_by_hop(name: &HeaderName, extra: &[String]) -> bool {
    HOP_BY_HOP.contains(&name.as_str()) || extra.iter().any(|t| t == name.as_str())
}

/// Build the request sent to `address`.
///
/// Strips hop-by-hop headers, points `Host` at the backend and appends
/// the client to `x-forwarded-for`.
pub fn build_backend_request(address: &str, request: &GatewayRequest) -> Result<http::Request<BackendBody>, GatewayError> {
    let protocol = |reason: String| GatewayError::Protocol {
        host: address.to_string(),
        reason,
    };

    let uri: http::Uri = request
        .path_and_query()
        .parse()
        .map_err(|e: http::uri::InvalidUri| protocol(e.to_string()))?;

    let mut out = http::Request::new(Full::new(request.body.clone()));
    *out.method_mut() = request.method.clone();
    *out.uri_mut() = uri;

    let extra = connection_tokens(&request.headers);
    let headers = out.headers_mut();
    for (name, value) in request.headers.iter() {
        if name == HOST || name == X_FORWARDED_FOR || is_hop_by_hop(name, &extra) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let host = HeaderValue::from_str(address).map_err(|e| protocol(e.to_string()))?;
    headers.insert(HOST, host);

    let prior: Vec<&str> = request
        .headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let mut forwarded = prior.join(", ");
    if let Some(addr) = request.client_addr {
        if !forwarded.is_empty() {
            forwarded.push_str(", ");
        }
        forwarded.push_str(&addr.to_string());
    }
    if !forwarded.is_empty() {
        let value = HeaderValue::from_str(&forwarded).map_err(|e| protocol(e.to_string()))?;
        headers.insert(X_FORWARDED_FOR, value);
    }

    Ok(out)
}

/// Response headers kept for the client. The body is re-framed, so
/// `content-length` goes too.
fn response_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let extra = connection_tokens(headers);
    headers
        .iter()
        .filter(|(name, _)| *name != CONTENT_LENGTH && !is_hop_by_hop(name, &extra))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::{MemoryCacheStore, PrometheusExporter};
    use bytes::Bytes;
    use crate::domain::entities::InstanceSpec;
    use crate::infrastructure::clock::SystemClock;
    use crate::infrastructure::connection_pool::PoolConfig;
    use crate::infrastructure::multi_level_cache::{CacheRule, CacheSettings};
    use crate::infrastructure::registry::RegistryConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(ports: &[u16], rules: Vec<CacheRule>, config: PipelineConfig) -> (GatewayService, Arc<PrometheusExporter>) {
        let registry = Arc::new(BackendRegistry::new(RegistryConfig::default(), Arc::new(SystemClock)));
        for port in ports {
            registry.add_instance("api", &InstanceSpec::new("127.0.0.1", *port, 1));
        }
        let cache = Arc::new(MultiLevelCache::new(
            CacheSettings::default(),
            rules,
            Arc::new(MemoryCacheStore::new()),
            Arc::new(SystemClock),
        ));
        let metrics = Arc::new(PrometheusExporter::new());
        let service = GatewayService::new(
            registry,
            ConnectionPool::new(PoolConfig {
                connect_timeout: Duration::from_millis(500),
                ..PoolConfig::default()
            }),
            cache,
            metrics.clone(),
            config,
        );
        (service, metrics)
    }

    fn fast_retries() -> PipelineConfig {
        PipelineConfig {
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = PipelineConfig {
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_millis(350),
            ..PipelineConfig::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(2), Duration::from_millis(350));
        assert_eq!(config.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_backend_request_rewrites_headers() {
        let request = GatewayRequest::get("api", "/users")
            .with_query("page=2")
            .with_header(HOST, HeaderValue::from_static("gateway.local"))
            .with_header(http::header::CONNECTION, HeaderValue::from_static("keep-alive, x-session-hop"))
            .with_header(HeaderName::from_static("x-session-hop"), HeaderValue::from_static("1"))
            .with_header(HeaderName::from_static("keep-alive"), HeaderValue::from_static("timeout=5"))
            .with_header(HeaderName::from_static("x-forwarded-for"), HeaderValue::from_static("203.0.113.9"))
            .with_header(http::header::ACCEPT, HeaderValue::from_static("application/json"))
            .with_client_addr(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));

        let out = build_backend_request("127.0.0.1:8001", &request).unwrap();
        assert_eq!(out.uri(), "/users?page=2");
        assert_eq!(out.headers()[HOST], "127.0.0.1:8001");
        assert_eq!(out.headers()["x-forwarded-for"], "203.0.113.9, 10.1.2.3");
        assert_eq!(out.headers()[http::header::ACCEPT], "application/json");
        assert!(out.headers().get(http::header::CONNECTION).is_none());
        assert!(out.headers().get("keep-alive").is_none());
        assert!(out.headers().get("x-session-hop").is_none());
    }

    #[test]
    fn test_response_headers_drop_framing() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        headers.insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let kept = response_headers(&headers);
        assert_eq!(kept, vec![("content-type".to_string(), "text/plain".to_string())]);
    }

    #[test]
    fn test_cache_key_uses_vary_headers() {
        let config = PipelineConfig {
            vary_headers: vec!["accept-language".into()],
            ..PipelineConfig::default()
        };
        let (service, _) = service(&[], vec![], config);

        let en = GatewayRequest::get("api", "/content/a")
            .with_header(http::header::ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        let de = GatewayRequest::get("api", "/content/a")
            .with_header(http::header::ACCEPT_LANGUAGE, HeaderValue::from_static("de"));

        assert_ne!(service.cache_key(&en), service.cache_key(&de));
        assert!(service.cache_key(&en).as_str().ends_with("|accept-language=en"));
    }

    #[tokio::test]
    async fn test_forward_success() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/1"))
            .and(header("host", format!("127.0.0.1:{}", backend.address().port()).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string("alice"))
            .expect(1)
            .mount(&backend)
            .await;

        let (service, metrics) = service(&[backend.address().port()], vec![], fast_retries());
        let response = service.handle(GatewayRequest::get("api", "/users/1")).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"alice"));
        assert!(matches!(response.source, ResponseSource::Backend(_)));
        assert_eq!(
            metrics
                .pool_metrics("api")
                .unwrap()
                .backend
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_pool() {
        let (service, metrics) = service(&[], vec![], fast_retries());
        let err = service
            .handle(GatewayRequest::get("nope", "/"))
            .await
            .unwrap_err();

        assert_eq!(err, GatewayError::UnknownPool { pool: "nope".into() });
        assert_eq!(err.status_code(), 404);
        assert_eq!(metrics.error_count("unknown_pool"), 1);
    }

    #[tokio::test]
    async fn test_post_5xx_forwarded_without_retry() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .expect(1)
            .mount(&backend)
            .await;

        let (service, _) = service(&[backend.address().port()], vec![], fast_retries());
        let request = GatewayRequest::new("api", http::Method::POST, "/orders").with_body("{}");
        let response = service.handle(request).await.unwrap();

        assert_eq!(response.status, 503);
        assert_eq!(response.body, Bytes::from_static(b"busy"));
    }

    #[tokio::test]
    async fn test_get_5xx_retried_on_other_instance() {
        let failing = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&failing)
            .await;
        let healthy = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&healthy)
            .await;

        let (service, metrics) = service(
            &[failing.address().port(), healthy.address().port()],
            vec![],
            fast_retries(),
        );

        // Two round-robin requests start on the failing instance at least once.
        for _ in 0..2 {
            let response = service.handle(GatewayRequest::get("api", "/")).await.unwrap();
            assert_eq!(response.status, 200);
        }
        let retries = metrics
            .pool_metrics("api")
            .unwrap()
            .retries
            .load(std::sync::atomic::Ordering::Relaxed);
        assert!(retries >= 1);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&backend)
            .await;

        let config = PipelineConfig {
            request_timeout: Duration::from_millis(50),
            retry_count: 0,
            ..fast_retries()
        };
        let (service, _) = service(&[backend.address().port()], vec![], config);
        let err = service.handle(GatewayRequest::get("api", "/")).await.unwrap_err();

        match err {
            GatewayError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 1);
                assert!(matches!(*last, GatewayError::BackendTimeout { .. }));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(service.connections().summary().total, 0);
    }
}
