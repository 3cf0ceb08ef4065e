//! HTTP surface: two independent listeners (spec §6) sharing one
//! [`GatewayState`]. Everything interesting — credential selection,
//! rotation, translation — happens below this layer; these routers exist
//! only to give the core pipeline an HTTP shape (spec §1 scope).

pub mod admin;
pub mod auth;
pub mod gemini;
pub mod ops;
pub mod openai;
pub mod state;

pub use state::GatewayState;

use axum::{Router, middleware};

/// Builds the OpenAI-compatible listener's router: `/v1/...` routes plus
/// the shared ops endpoints, permissive CORS, and access logging. The
/// `/admin/*` sub-path is merged in after the CORS layer is applied, so it
/// is served alongside the public routes without inheriting their
/// cross-origin allowance (spec §6).
pub fn openai_router(state: GatewayState) -> Router {
    let public = openai::router().merge(ops::router()).fallback(ops::fallback).layer(ops::permissive_cors());

    public
        .merge(admin::router())
        .with_state(state)
        .layer(middleware::from_fn(ops::access_log))
}

/// Builds the Gemini-native listener's router: `/v1beta/...` and
/// `/v1internal/...` routes plus the shared ops endpoints and `/admin/*`.
pub fn gemini_router(state: GatewayState) -> Router {
    let public = gemini::router().merge(ops::router()).fallback(ops::fallback).layer(ops::permissive_cors());

    public
        .merge(admin::router())
        .with_state(state)
        .layer(middleware::from_fn(ops::access_log))
}
