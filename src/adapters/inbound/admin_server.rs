//! Admin API Server
//!
//! Health, Prometheus metrics, pool/cache inspection, cache invalidation,
//! manual discovery events and circuit resets.

use crate::adapters::outbound::PrometheusExporter;
use crate::application::GatewayService;
use crate::domain::entities::{DiscoveryEvent, InstanceSpec};
use crate::domain::value_objects::InstanceId;
use crate::infrastructure::connection_pool::ConnectionCounts;
use crate::infrastructure::registry::PoolSnapshot;
use crate::infrastructure::shutdown::ShutdownController;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub pools: usize,
    pub uptime_secs: u64,
}

/// Pool with its connection counts.
#[derive(Debug, Serialize)]
pub struct PoolStatus {
    #[serde(flatten)]
    pub pool: PoolSnapshot,
    pub connections: ConnectionCounts,
}

/// Cache invalidation request.
#[derive(Debug, Clone, Deserialize)]
pub struct InvalidateRequest {
    /// Exact key or `*`/`?` glob
    pub target: String,
}

/// Admin server state.
#[derive(Clone)]
pub struct AdminState {
    pub service: Arc<GatewayService>,
    pub exporter: Arc<PrometheusExporter>,
    pub started_at: Instant,
}

impl AdminState {
    pub fn new(service: Arc<GatewayService>, exporter: Arc<PrometheusExporter>) -> Self {
        Self {
            service,
            exporter,
            started_at: Instant::now(),
        }
    }

    fn pool_status(&self, pool: PoolSnapshot) -> PoolStatus {
        let connections = self
            .service
            .connections()
            .pool_totals()
            .remove(&pool.name)
            .unwrap_or_default();
        PoolStatus { pool, connections }
    }
}

/// Admin API server.
pub struct AdminServer {
    listen_addr: String,
    state: AdminState,
    shutdown: ShutdownController,
}

impl AdminServer {
    pub fn new(listen_addr: String, state: AdminState, shutdown: ShutdownController) -> Self {
        Self {
            listen_addr,
            state,
            shutdown,
        }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until shutdown is initiated.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("admin API listening on {}", self.listen_addr);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
            .await?;
        Ok(())
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/pools", get(list_pools_handler))
        .route("/admin/pools/:pool", get(get_pool_handler))
        .route("/admin/pools/:pool/instances", post(add_instance_handler))
        .route("/admin/pools/:pool/instances/:address", delete(remove_instance_handler))
        .route("/admin/instances/:id/circuit/reset", post(reset_circuit_handler))
        .route("/admin/cache", get(cache_stats_handler))
        .route("/admin/cache/invalidate", post(invalidate_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Handler functions

async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        pools: state.service.registry().pool_names().len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let body = state.exporter.export(
        state.service.registry(),
        state.service.connections(),
        state.service.cache(),
    );
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn list_pools_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let pools: Vec<PoolStatus> = state
        .service
        .registry()
        .pool_snapshots()
        .into_iter()
        .map(|pool| state.pool_status(pool))
        .collect();
    let total = pools.len();
    Json(serde_json::json!({ "pools": pools, "total": total }))
}

async fn get_pool_handler(State(state): State<AdminState>, Path(pool): Path<String>) -> impl IntoResponse {
    match state.service.registry().pool_snapshot(&pool) {
        Some(snapshot) => (StatusCode::OK, Json(serde_json::json!(state.pool_status(snapshot)))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "pool": pool,
                "error": "pool not found"
            })),
        ),
    }
}

async fn add_instance_handler(
    State(state): State<AdminState>,
    Path(pool): Path<String>,
    Json(spec): Json<InstanceSpec>,
) -> impl IntoResponse {
    let address = spec.address();
    let added = state.service.registry().apply(DiscoveryEvent::Added {
        pool: pool.clone(),
        instance: spec,
    });

    if added {
        (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "pool": pool,
                "address": address,
                "added": true
            })),
        )
    } else {
        (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "pool": pool,
                "address": address,
                "error": "instance already registered"
            })),
        )
    }
}

async fn remove_instance_handler(
    State(state): State<AdminState>,
    Path((pool, address)): Path<(String, String)>,
) -> impl IntoResponse {
    let removed = state.service.registry().apply(DiscoveryEvent::Removed {
        pool: pool.clone(),
        address: address.clone(),
    });

    if removed {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "pool": pool,
                "address": address,
                "removed": true
            })),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "pool": pool,
                "address": address,
                "error": "instance not found"
            })),
        )
    }
}

async fn reset_circuit_handler(State(state): State<AdminState>, Path(id): Path<u64>) -> impl IntoResponse {
    if state.service.registry().reset_circuit(InstanceId(id)) {
        tracing::info!(instance = id, "circuit reset by admin");
        (StatusCode::OK, Json(serde_json::json!({ "id": id, "reset": true })))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "id": id, "error": "instance not found" })),
        )
    }
}

async fn cache_stats_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.service.cache().stats())
}

async fn invalidate_handler(State(state): State<AdminState>, Json(req): Json<InvalidateRequest>) -> impl IntoResponse {
    let result = state.service.cache().invalidate(&req.target).await;
    Json(serde_json::json!({
        "ok": result.ok(),
        "removed": result.removed,
        "l2_removed": result.l2_removed,
    }))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemoryCacheStore;
    use crate::application::PipelineConfig;
    use crate::domain::entities::CachedResponse;
    use crate::domain::value_objects::{CacheKey, CircuitState};
    use crate::infrastructure::circuit_breaker::CircuitBreakerConfig;
    use crate::infrastructure::clock::SystemClock;
    use crate::infrastructure::connection_pool::{ConnectionPool, PoolConfig};
    use crate::infrastructure::multi_level_cache::{CacheSettings, MultiLevelCache};
    use crate::infrastructure::registry::{BackendRegistry, RegistryConfig};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AdminState {
        let config = RegistryConfig {
            circuit: CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
            ..RegistryConfig::default()
        };
        let registry = Arc::new(BackendRegistry::new(config, Arc::new(SystemClock)));
        registry.add_instance("users", &InstanceSpec::new("10.0.0.1", 8080, 1));

        let cache = Arc::new(MultiLevelCache::new(
            CacheSettings::default(),
            vec![],
            Arc::new(MemoryCacheStore::new()),
            Arc::new(SystemClock),
        ));
        let exporter = Arc::new(PrometheusExporter::new());
        let service = GatewayService::new(
            registry,
            ConnectionPool::new(PoolConfig::default()),
            cache,
            exporter.clone(),
            PipelineConfig::default(),
        );
        AdminState::new(Arc::new(service), exporter)
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(state()).oneshot(request("GET", "/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pools"], 1);
    }

    #[tokio::test]
    async fn test_metrics_text() {
        let response = router(state()).oneshot(request("GET", "/metrics", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("gateway_backend_healthy"));
    }

    #[tokio::test]
    async fn test_pools_listing_and_lookup() {
        let app = router(state());

        let body = json(app.clone().oneshot(request("GET", "/admin/pools", None)).await.unwrap()).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["pools"][0]["name"], "users");
        assert_eq!(body["pools"][0]["connections"]["total"], 0);
        assert_eq!(body["pools"][0]["instances"][0]["address"], "10.0.0.1:8080");

        let missing = app.oneshot(request("GET", "/admin/pools/orders", None)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_discovery_add_and_remove() {
        let state = state();
        let app = router(state.clone());

        let spec = serde_json::json!({ "host": "10.0.0.2", "port": 8080, "weight": 3 });
        let added = app
            .clone()
            .oneshot(request("POST", "/admin/pools/users/instances", Some(spec.clone())))
            .await
            .unwrap();
        assert_eq!(added.status(), StatusCode::CREATED);
        assert_eq!(state.service.registry().pool_snapshot("users").unwrap().instances.len(), 2);

        let duplicate = app
            .clone()
            .oneshot(request("POST", "/admin/pools/users/instances", Some(spec)))
            .await
            .unwrap();
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let removed = app
            .clone()
            .oneshot(request("DELETE", "/admin/pools/users/instances/10.0.0.2:8080", None))
            .await
            .unwrap();
        assert_eq!(removed.status(), StatusCode::OK);

        let gone = app
            .oneshot(request("DELETE", "/admin/pools/users/instances/10.0.0.2:8080", None))
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_circuit_reset() {
        let state = state();
        let instance = state.service.registry().all_instances().remove(0);
        state.service.registry().record_failure(&instance);
        assert_eq!(instance.circuit().state(), CircuitState::Open);

        let uri = format!("/admin/instances/{}/circuit/reset", instance.id());
        let response = router(state.clone()).oneshot(request("POST", &uri, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(instance.circuit().state(), CircuitState::Closed);

        let missing = router(state)
            .oneshot(request("POST", "/admin/instances/999999/circuit/reset", None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cache_invalidate_and_stats() {
        let state = state();
        let cache = state.service.cache();
        for path in ["/a", "/b"] {
            let key = CacheKey::new("users", "GET", path, None, &[]);
            let value = CachedResponse {
                status: 200,
                headers: vec![],
                body: "x".into(),
            };
            assert!(cache.set(&key, value, Duration::from_secs(60)).await);
        }

        let app = router(state.clone());
        let body = json(
            app.clone()
                .oneshot(request(
                    "POST",
                    "/admin/cache/invalidate",
                    Some(serde_json::json!({ "target": "users:GET:*" })),
                ))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["removed"], 2);

        let stats = json(app.oneshot(request("GET", "/admin/cache", None)).await.unwrap()).await;
        assert_eq!(stats["enabled"], true);
        assert_eq!(stats["l2_backend"], "memory");
    }
}
