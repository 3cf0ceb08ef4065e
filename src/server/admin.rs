//! Admin/management sub-path: credential list/ban/unban, routing snapshot,
//! and storage health (spec §6 "Admin/management sub-path"). Gated by the
//! same [`RequireKeyAuth`] extractor as the rest of the gateway — which
//! already accepts the admin session cookie as one of its transports — but
//! mounted without the permissive CORS layer the other routes carry, since
//! nothing outside an operator's own browser session should be allowed to
//! call it cross-origin.

use crate::credential::SourceTag;
use crate::routing::RoutingStateSnapshot;
use crate::server::auth::RequireKeyAuth;
use crate::server::state::GatewayState;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::time::Duration;

const DEFAULT_BAN_SECS: u64 = 1800;

#[derive(Serialize)]
struct CredentialView {
    id: String,
    source: &'static str,
    banned: bool,
    in_flight: u32,
    consecutive_failures: u32,
    failures_401: u32,
    failures_403: u32,
    failures_429: u32,
    failures_5xx: u32,
}

fn source_name(tag: SourceTag) -> &'static str {
    match tag {
        SourceTag::File => "file",
        SourceTag::Env => "env",
        SourceTag::Storage => "storage",
    }
}

/// `GET /admin/credentials`: one row per loaded credential with live ban
/// and failure-counter state.
async fn list_credentials(State(state): State<GatewayState>, _auth: RequireKeyAuth) -> Json<Vec<CredentialView>> {
    let now = chrono::Utc::now();
    let views = state
        .manager
        .all()
        .into_iter()
        .map(|cred| CredentialView {
            id: cred.id.clone(),
            source: source_name(cred.source_tag),
            banned: cred.is_banned(now),
            in_flight: cred.in_flight.load(Ordering::Acquire),
            consecutive_failures: cred.consecutive_failures.load(Ordering::Acquire),
            failures_401: cred.failures_401.load(Ordering::Acquire),
            failures_403: cred.failures_403.load(Ordering::Acquire),
            failures_429: cred.failures_429.load(Ordering::Acquire),
            failures_5xx: cred.failures_5xx.load(Ordering::Acquire),
        })
        .collect();
    Json(views)
}

#[derive(Deserialize, Default)]
struct BanQuery {
    duration_secs: Option<u64>,
}

/// `POST /admin/credentials/{id}/ban?duration_secs=N`: manual ban, defaults
/// to 30 minutes when no duration is given.
async fn ban_credential(
    State(state): State<GatewayState>,
    _auth: RequireKeyAuth,
    Path(id): Path<String>,
    Query(query): Query<BanQuery>,
) -> Response {
    let duration = Duration::from_secs(query.duration_secs.unwrap_or(DEFAULT_BAN_SECS));
    if state.manager.ban(&id, duration) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// `POST /admin/credentials/{id}/unban`.
async fn unban_credential(State(state): State<GatewayState>, _auth: RequireKeyAuth, Path(id): Path<String>) -> Response {
    if state.manager.unban(&id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// `GET /admin/routing`: cooldown/strike snapshot per credential.
async fn routing_snapshot(State(state): State<GatewayState>, _auth: RequireKeyAuth) -> Json<RoutingStateSnapshot> {
    Json(state.routing.snapshot())
}

/// `GET /admin/storage`: backend name plus live health check.
async fn storage_health(State(state): State<GatewayState>, _auth: RequireKeyAuth) -> Response {
    let health = state.storage.health().await;
    let status = if health.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(health)).into_response()
}

pub fn router() -> Router<GatewayState> {
    Router::new()
        .route("/admin/credentials", get(list_credentials))
        .route("/admin/credentials/{id}/ban", post(ban_credential))
        .route("/admin/credentials/{id}/unban", post(unban_credential))
        .route("/admin/routing", get(routing_snapshot))
        .route("/admin/storage", get(storage_health))
}
