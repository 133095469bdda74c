//! Gateway HTTP Server
//!
//! Inbound adapter mapping `/{pool}/{path..}` onto the request pipeline.
//! Pipeline errors become 404/502/503/504 responses.

use crate::application::GatewayService;
use crate::domain::entities::{GatewayRequest, GatewayResponse, ResponseSource};
use crate::domain::errors::GatewayError;
use crate::infrastructure::shutdown::ShutdownController;
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, OriginalUri, Path, RawQuery, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Gateway server state.
#[derive(Clone)]
pub struct GatewayState {
    pub service: Arc<GatewayService>,
    pub shutdown: ShutdownController,
}

/// Client-facing HTTP server.
pub struct GatewayServer {
    listen_addr: String,
    state: GatewayState,
}

impl GatewayServer {
    pub fn new(listen_addr: String, service: Arc<GatewayService>, shutdown: ShutdownController) -> Self {
        Self {
            listen_addr,
            state: GatewayState { service, shutdown },
        }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until shutdown is initiated.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("gateway listening on {}", self.listen_addr);

        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, self.router().into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
            .await?;

        tracing::info!("gateway listener closed");
        Ok(())
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/:pool", any(root_handler))
        .route("/:pool/*path", any(proxy_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root_handler(
    State(state): State<GatewayState>,
    Path(pool): Path<String>,
    method: Method,
    RawQuery(query): RawQuery,
    client: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, pool, String::new(), method, query, client, headers, body).await
}

async fn proxy_handler(
    State(state): State<GatewayState>,
    Path((pool, _)): Path<(String, String)>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    RawQuery(query): RawQuery,
    client: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = backend_path(uri.path()).to_string();
    dispatch(state, pool, path, method, query, client, headers, body).await
}

/// The request path with its leading `/{pool}` segment removed, still
/// percent-encoded as the client sent it.
fn backend_path(raw: &str) -> &str {
    let rest = raw.strip_prefix('/').unwrap_or(raw);
    match rest.find('/') {
        Some(i) => &rest[i..],
        None => "/",
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: GatewayState,
    pool: String,
    path: String,
    method: Method,
    query: Option<String>,
    client: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if state.shutdown.is_shutdown() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }
    let _guard = state.shutdown.request_guard();

    let mut request = GatewayRequest::new(pool, method, path).with_body(body);
    request.headers = headers;
    if let Some(query) = query {
        request = request.with_query(query);
    }
    if let Some(ConnectInfo(addr)) = client {
        request = request.with_client_addr(addr.ip());
    }

    match state.service.handle(request).await {
        Ok(response) => into_http(response),
        Err(e) => gateway_error(&e),
    }
}

fn into_http(response: GatewayResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;

    let headers = out.headers_mut();
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            headers.append(name, value);
        }
    }

    let cache = match response.source {
        ResponseSource::Cache => "HIT",
        ResponseSource::Coalesced => "COALESCED",
        ResponseSource::Backend(_) => "MISS",
    };
    headers.insert("x-cache", HeaderValue::from_static(cache));
    out
}

fn gateway_error(error: &GatewayError) -> Response {
    let status = match error {
        // A backend 5xx only surfaces as an error once retries ran out.
        GatewayError::BackendStatus { .. } => StatusCode::BAD_GATEWAY,
        other => StatusCode::from_u16(other.status_code()).unwrap_or(StatusCode::BAD_GATEWAY),
    };
    error_response(status, &error.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({
        "error": message,
        "status": status.as_u16(),
    });
    (status, axum::Json(body)).into_response()
}
