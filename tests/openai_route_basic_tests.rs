use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use std::sync::Arc;
use tower::ServiceExt;

use codeassist_gateway::Config;
use codeassist_gateway::credential::{CredentialManager, EventBus};
use codeassist_gateway::dispatch::{ClientCache, Dispatcher};
use codeassist_gateway::routing::RoutingStrategy;
use codeassist_gateway::server::{self, GatewayState};
use codeassist_gateway::storage::file::FileStorage;
use codeassist_gateway::usage::UsageTracker;

/// Builds a `GatewayState` wired the same way `main` does, but against a
/// scratch file-storage directory and with zero credentials loaded, so
/// tests exercise the auth/validation/no-credential paths without talking
/// to any real upstream.
async fn test_state(api_key: &str) -> (GatewayState, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let storage: Arc<dyn codeassist_gateway::storage::Storage> = Arc::new(FileStorage::new(dir.path()));

    let cfg = Config::default();
    let events = Arc::new(EventBus::new());
    let http = reqwest::Client::new();

    let manager = CredentialManager::new(
        cfg.credential_manager.clone(),
        storage.clone(),
        events.clone(),
        http,
        dir.path().join("auth"),
    );
    manager.load().await;
    assert!(manager.is_empty(), "test harness expects zero credentials loaded");

    let routing = Arc::new(RoutingStrategy::new(manager.clone(), cfg.credential_manager.clone()));
    let clients = ClientCache::new(&cfg.geminicli);
    clients.install_invalidation_hook(&events);
    let dispatcher = Dispatcher::new(manager.clone(), routing.clone(), clients, cfg.dispatch.clone(), cfg.geminicli.clone());
    let usage = UsageTracker::new(cfg.usage.clone(), storage.clone());

    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .build_recorder()
        .handle();

    let state = GatewayState {
        manager,
        routing,
        dispatcher,
        usage,
        storage,
        api_key: Arc::from(api_key),
        admin_cookie_name: Arc::from("codeassist_session"),
        prometheus,
    };

    (state, dir)
}

#[tokio::test]
async fn chat_completions_rejects_missing_and_invalid_keys_and_reports_no_credentials() {
    let (state, _dir) = test_state("test-key").await;
    let app = server::openai_router(state);

    // 1) no key at all -> 401
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"model":"gemini-2.0-flash","messages":[]}"#))
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // 2) wrong key -> 401
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .header("x-api-key", "wrong-key")
                .body(Body::from(r#"{"model":"gemini-2.0-flash","messages":[]}"#))
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // 3) correct key, malformed JSON -> 400
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .header("x-api-key", "test-key")
                .body(Body::from("not json"))
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // 4) correct key, well-formed request, zero credentials loaded -> 503
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .header("authorization", "Bearer test-key")
                .body(Body::from(
                    r#"{"model":"gemini-2.0-flash","messages":[{"role":"user","content":"hi"}]}"#,
                ))
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = to_bytes(resp.into_body(), usize::MAX).await.expect("failed to read body");
    let json: serde_json::Value = serde_json::from_slice(&body).expect("response was not JSON");
    assert_eq!(json["error"]["type"], "no_credentials");
}

#[tokio::test]
async fn healthz_reports_degraded_with_zero_credentials() {
    let (state, _dir) = test_state("test-key").await;
    let app = server::openai_router(state);

    let resp = app
        .oneshot(Request::builder().method("GET").uri("/healthz").body(Body::empty()).expect("failed to build request"))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = to_bytes(resp.into_body(), usize::MAX).await.expect("failed to read body");
    let json: serde_json::Value = serde_json::from_slice(&body).expect("response was not JSON");
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["live_credentials"], 0);
}
