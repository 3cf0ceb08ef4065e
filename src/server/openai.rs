//! OpenAI-compatible listener: `POST /v1/chat/completions`, `POST
//! /v1/completions`, `GET /v1/models`, `GET /v1/models/{m}` — spec §6.
//!
//! Every handler translates into the Gemini-native schema, calls the same
//! dispatcher the Gemini listener uses, then translates the response back.
//! `translate(request) -> request` itself lives in `gateway-schema` and is
//! treated as a pure function here (spec §1 scope).

use crate::error::GatewayError;
use crate::model_catalog::MODEL_REGISTRY;
use crate::routing::RoutingStrategy;
use crate::server::auth::RequireKeyAuth;
use crate::server::state::GatewayState;
use axum::{
    Json, Router,
    extract::{Path, State},
    response::{IntoResponse, Response, sse::KeepAlive, sse::Sse},
    routing::{get, post},
};
use gateway_schema::{OpenaiChatRequest, OpenaiModelList, translate};
use std::sync::LazyLock;
use uuid::Uuid;

static MODEL_LIST: LazyLock<OpenaiModelList> = LazyLock::new(|| {
    OpenaiModelList::from_model_names(MODEL_REGISTRY.names(), "codeassist-gateway".to_string())
});

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

fn project_for(state: &GatewayState, sticky: Option<&str>) -> String {
    sticky
        .and_then(|id| state.manager.get(id))
        .and_then(|c| c.project_id())
        .unwrap_or_default()
}

async fn chat_completions(
    State(state): State<GatewayState>,
    _auth: RequireKeyAuth,
    headers: axum::http::HeaderMap,
    body: Result<Json<OpenaiChatRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Response, GatewayError> {
    let Json(request) = body.map_err(GatewayError::from)?;
    let sticky = RoutingStrategy::sticky_id_from_headers(&headers);
    let project = project_for(&state, sticky.as_deref());
    let model = request.model.clone();
    let wants_stream = request.stream.unwrap_or(false);
    let gemini_request = translate::openai_to_gemini(&request);

    if wants_stream {
        let (items, outcome) = state
            .dispatcher
            .stream(&model, &project, sticky.as_deref(), gemini_request)
            .await
            .map_err(GatewayError::from)?;
        state.usage.increment(&outcome.credential_id, "requests", 1);

        let id = completion_id();
        let created = chrono::Utc::now().timestamp();
        let model_used = outcome.model_used.clone();
        let events = futures::StreamExt::map(items, move |item| {
            let chunk = match item {
                Ok(crate::dispatch::sse::StreamItem::Done) => {
                    return Ok(axum::response::sse::Event::default().data(crate::dispatch::sse::DONE_MARKER));
                }
                Ok(crate::dispatch::sse::StreamItem::Body(body)) => {
                    translate::gemini_to_openai_chunk(&body, &model_used, &id, created)
                }
                Err(e) => return Err(e),
            };
            axum::response::sse::Event::default()
                .json_data(chunk)
                .map_err(|e| crate::error::GeminiError::StreamProtocolError(e.to_string()))
        });
        return Ok(Sse::new(events).keep_alive(KeepAlive::default()).into_response());
    }

    let (body, outcome) = state
        .dispatcher
        .generate(&model, &project, sticky.as_deref(), gemini_request)
        .await
        .map_err(GatewayError::from)?;
    state.usage.increment(&outcome.credential_id, "requests", 1);

    let id = completion_id();
    let created = chrono::Utc::now().timestamp();
    let response = translate::gemini_to_openai_response(&body, &outcome.model_used, &id, created);
    Ok(Json(response).into_response())
}

/// Legacy `/v1/completions`: the same chat path, with the prompt folded
/// into a single user message.
async fn completions(
    state: State<GatewayState>,
    auth: RequireKeyAuth,
    headers: axum::http::HeaderMap,
    body: Result<Json<serde_json::Value>, axum::extract::rejection::JsonRejection>,
) -> Result<Response, GatewayError> {
    let Json(raw) = body.map_err(GatewayError::from)?;
    let model = raw.get("model").and_then(serde_json::Value::as_str).unwrap_or_default().to_string();
    let prompt = raw.get("prompt").and_then(serde_json::Value::as_str).unwrap_or_default();
    let stream = raw.get("stream").and_then(serde_json::Value::as_bool);

    let request = OpenaiChatRequest {
        model,
        messages: vec![translate::user_message(prompt)],
        stream,
        temperature: raw.get("temperature").and_then(serde_json::Value::as_f64),
        top_p: raw.get("top_p").and_then(serde_json::Value::as_f64),
        max_tokens: raw.get("max_tokens").and_then(serde_json::Value::as_u64).map(|v| v as u32),
        stop: raw.get("stop").cloned(),
        tools: None,
        tool_choice: None,
        extra: Default::default(),
    };

    chat_completions(state, auth, headers, Ok(Json(request))).await
}

async fn list_models(_auth: RequireKeyAuth) -> Json<OpenaiModelList> {
    Json(MODEL_LIST.clone())
}

async fn get_model(_auth: RequireKeyAuth, Path(model): Path<String>) -> Result<Response, GatewayError> {
    match MODEL_LIST.data.iter().find(|m| m.id == model) {
        Some(m) => Ok(Json(m.clone()).into_response()),
        None => Err(GatewayError::InvalidRequest(format!("unknown model: {model}"))),
    }
}

pub fn router() -> Router<GatewayState> {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{model}", get(get_model))
}
