//! Cross-cutting HTTP concerns shared by both listeners: access logging,
//! CORS, `/healthz`, and `/metrics` — spec §6.

use crate::server::state::GatewayState;
use axum::{
    Router,
    extract::{Request, State},
    http::{StatusCode, Version, header::USER_AGENT},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

fn format_http_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "HTTP/?",
    }
}

/// Permissive CORS (no credentials) applied to every non-management route,
/// per spec §6 ("all other paths emit permissive CORS without credentials").
pub fn permissive_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub async fn access_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let version = req.version();
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let start = Instant::now();
    let resp = next.run(req).await;

    let status = resp.status();
    let latency_ms = start.elapsed().as_millis();
    let path = uri.path();
    let protocol = format_http_version(version);

    if status.is_server_error() {
        error!("| {:>3} | {:^7} | {:<8} | {} | {}ms | {}", status.as_u16(), method.as_str(), protocol, path, latency_ms, user_agent);
    } else if status.is_client_error() {
        warn!("| {:>3} | {:^7} | {:<8} | {} | {}ms | {}", status.as_u16(), method.as_str(), protocol, path, latency_ms, user_agent);
    } else {
        info!("| {:>3} | {:^7} | {:<8} | {} | {}ms | {}", status.as_u16(), method.as_str(), protocol, path, latency_ms, user_agent);
    }

    resp
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    live_credentials: usize,
    storage: &'static str,
    storage_healthy: bool,
}

/// `GET /healthz`: 200 when the credential manager reports at least one
/// live credential and the storage backend reports healthy, 503 otherwise.
async fn healthz(State(state): State<GatewayState>) -> Response {
    let live_credentials = state.manager.len();
    let storage_health = state.storage.health().await;

    let body = HealthBody {
        status: if live_credentials > 0 && storage_health.healthy { "ok" } else { "degraded" },
        live_credentials,
        storage: state.storage.name(),
        storage_healthy: storage_health.healthy,
    };

    let status = if live_credentials > 0 && storage_health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, axum::Json(body)).into_response()
}

/// `GET /metrics`: Prometheus text exposition of everything registered via
/// the `metrics` facade (request counters, retry counters, SSE part
/// counters, storage op latencies, ...). Registration itself happens at
/// the call sites (spec §1 out-of-scope: "Prometheus counter registration").
async fn metrics(State(state): State<GatewayState>) -> impl IntoResponse {
    let body = state.prometheus.render();
    ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

pub fn router() -> Router<GatewayState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
}

pub async fn fallback() -> StatusCode {
    StatusCode::NOT_FOUND
}
