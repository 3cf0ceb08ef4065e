//! Gemini-native listener: `POST /v1beta/models/{m}:generateContent`,
//! `:streamGenerateContent`, `:countTokens`; `POST
//! /v1internal/{loadCodeAssist,onboardUser}`; `GET /v1beta/models` — spec §6.
//!
//! Handlers stay thin: parse, pick a project id, call the dispatcher, render.
//! The dispatcher and routing strategy carry the actual engineering; this
//! module exists to give them an HTTP shape.

use crate::dispatch::sse;
use crate::error::GeminiError;
use crate::model_catalog::MODEL_REGISTRY;
use crate::routing::RoutingStrategy;
use crate::server::auth::RequireKeyAuth;
use crate::server::state::GatewayState;
use axum::{
    Json, Router,
    extract::{Path, State},
    response::{
        IntoResponse, Response,
        sse::{KeepAlive, Sse},
    },
    routing::{get, post},
};
use gateway_schema::{GeminiGenerateContentRequest, GeminiModelList};
use serde_json::Value;
use std::sync::LazyLock;

static MODEL_LIST: LazyLock<GeminiModelList> =
    LazyLock::new(|| GeminiModelList::from_model_names(MODEL_REGISTRY.names()));

/// Default Google Cloud project used when a credential wasn't issued one.
fn project_for(state: &GatewayState, sticky: Option<&str>) -> Option<String> {
    sticky
        .and_then(|id| state.manager.get(id))
        .and_then(|c| c.project_id())
}

async fn generate_content(
    State(state): State<GatewayState>,
    Path(model): Path<String>,
    _auth: RequireKeyAuth,
    headers: axum::http::HeaderMap,
    body: Result<Json<GeminiGenerateContentRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Response, GeminiError> {
    let Json(request) = body?;
    let sticky = RoutingStrategy::sticky_id_from_headers(&headers);
    let project = project_for(&state, sticky.as_deref()).unwrap_or_default();

    let (body, outcome) = state.dispatcher.generate(&model, &project, sticky.as_deref(), request).await?;
    state.usage.increment(&outcome.credential_id, "requests", 1);
    Ok(Json(body).into_response())
}

async fn stream_generate_content(
    State(state): State<GatewayState>,
    Path(model): Path<String>,
    _auth: RequireKeyAuth,
    headers: axum::http::HeaderMap,
    body: Result<Json<GeminiGenerateContentRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Response, GeminiError> {
    let Json(request) = body?;
    let sticky = RoutingStrategy::sticky_id_from_headers(&headers);
    let project = project_for(&state, sticky.as_deref()).unwrap_or_default();

    let (items, outcome) = state.dispatcher.stream(&model, &project, sticky.as_deref(), request).await?;
    state.usage.increment(&outcome.credential_id, "requests", 1);

    let events = futures::StreamExt::map(items, |item| sse::to_gemini_event(item));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()).into_response())
}

async fn count_tokens(
    State(state): State<GatewayState>,
    Path(model): Path<String>,
    _auth: RequireKeyAuth,
    headers: axum::http::HeaderMap,
    body: Result<Json<GeminiGenerateContentRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Response, GeminiError> {
    let Json(request) = body?;
    let sticky = RoutingStrategy::sticky_id_from_headers(&headers);
    let project = project_for(&state, sticky.as_deref()).unwrap_or_default();

    let (value, _outcome) = state.dispatcher.count_tokens(&model, &project, sticky.as_deref(), request).await?;
    Ok(Json(value).into_response())
}

async fn internal_action(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    _auth: RequireKeyAuth,
    headers: axum::http::HeaderMap,
    body: Result<Json<Value>, axum::extract::rejection::JsonRejection>,
) -> Result<Response, GeminiError> {
    let Json(payload) = body?;
    let sticky = RoutingStrategy::sticky_id_from_headers(&headers);
    let (value, _outcome) = state.dispatcher.action(&name, sticky.as_deref(), payload).await?;
    Ok(Json(value).into_response())
}

async fn list_models(_auth: RequireKeyAuth) -> Json<GeminiModelList> {
    Json(MODEL_LIST.clone())
}

/// Splits the colon-suffixed Gemini path segment (e.g.
/// `gemini-2.5-pro:generateContent`) into `(model, verb)`. Axum's router
/// can't express a literal `:verb` suffix as a separate path segment
/// because Gemini's wire format puts it in the same segment as the model
/// name, so the three generate-content verbs share one route definition.
fn split_model_verb(path: &str) -> (String, &str) {
    match path.rsplit_once(':') {
        Some((model, verb)) => (model.to_string(), verb),
        None => (path.to_string(), ""),
    }
}

async fn model_dispatch(
    state: State<GatewayState>,
    Path(raw): Path<String>,
    auth: RequireKeyAuth,
    headers: axum::http::HeaderMap,
    body: Result<Json<GeminiGenerateContentRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Response, GeminiError> {
    let (model, verb) = split_model_verb(&raw);
    match verb {
        "generateContent" => generate_content(state, Path(model), auth, headers, body).await,
        "streamGenerateContent" => stream_generate_content(state, Path(model), auth, headers, body).await,
        "countTokens" => count_tokens(state, Path(model), auth, headers, body).await,
        other => Err(GeminiError::Internal(format!("unsupported verb: {other}"))),
    }
}

pub fn router() -> Router<GatewayState> {
    Router::new()
        .route("/v1beta/models", get(list_models))
        .route("/v1beta/models/{path}", post(model_dispatch))
        .route("/v1internal/{name}", post(internal_action))
}
