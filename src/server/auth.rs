//! Inbound authentication: a single configured API key accepted across a
//! handful of conventional transports (spec §6 "Authentication").
//!
//! `RequireKeyAuth` is an extractor rather than a middleware so each router
//! can choose whether to require it (the admin cookie path bypasses CORS,
//! not auth — both listeners always require a key).

use crate::server::state::GatewayState;
use axum::{
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::{
    extract::{CookieJar, cookie::PrivateCookieJar},
    headers::{Authorization, HeaderMapExt, authorization::Bearer},
};
use subtle::ConstantTimeEq;

fn extract_header_token(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(k) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(k.to_string());
    }
    if let Some(k) = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) {
        return Some(k.to_string());
    }
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

fn extract_query_token(query: Option<&str>) -> Option<String> {
    query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == "key")
            .map(|(_, v)| v.into_owned())
    })
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// An inbound request that carried a valid API key, via any of: `Authorization:
/// Bearer`, `x-api-key`, `x-goog-api-key`, `?key=`, or the admin session
/// cookie (named per `basic.admin_cookie_name`).
#[derive(Debug, Clone, Copy)]
pub struct RequireKeyAuth;

impl FromRequestParts<GatewayState> for RequireKeyAuth {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &GatewayState) -> Result<Self, Self::Rejection> {
        let expected = state.api_key.as_ref();

        if let Some(token) = extract_header_token(&parts.headers).or_else(|| extract_query_token(parts.uri.query())) {
            return if constant_time_eq(&token, expected) {
                Ok(RequireKeyAuth)
            } else {
                Err(AuthError::InvalidKey)
            };
        }

        if let Ok(jar) = PrivateCookieJar::<axum_extra::extract::cookie::Key>::from_request_parts(parts, state).await
        {
            if let Some(cookie) = jar.get(state.admin_cookie_name.as_ref()) {
                return if constant_time_eq(cookie.value(), expected) {
                    Ok(RequireKeyAuth)
                } else {
                    Err(AuthError::InvalidKey)
                };
            }
        }

        if let Ok(jar) = CookieJar::from_request_parts(parts, state).await {
            if let Some(cookie) = jar.get(state.admin_cookie_name.as_ref()) {
                return if constant_time_eq(cookie.value(), expected) {
                    Ok(RequireKeyAuth)
                } else {
                    Err(AuthError::InvalidKey)
                };
            }
        }

        Err(AuthError::MissingKey)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AuthError {
    MissingKey,
    InvalidKey,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let reason = match self {
            AuthError::MissingKey => "missing API key",
            AuthError::InvalidKey => "invalid API key",
        };
        crate::error::GatewayError::Unauthorized(reason.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn reads_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret-key".parse().unwrap());
        assert_eq!(extract_header_token(&headers), Some("secret-key".to_string()));
    }

    #[test]
    fn reads_x_api_key_before_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "from-x-api-key".parse().unwrap());
        headers.insert("authorization", "Bearer other".parse().unwrap());
        assert_eq!(extract_header_token(&headers), Some("from-x-api-key".to_string()));
    }

    #[test]
    fn reads_query_key() {
        assert_eq!(extract_query_token(Some("key=abc&other=1")), Some("abc".to_string()));
        assert_eq!(extract_query_token(Some("other=1")), None);
    }
}
