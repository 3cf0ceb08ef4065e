use axum::extract::rejection::JsonRejection;
use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error as ThisError;

use super::IsRetryable;
use super::oauth::OauthError;

/// Internal error type threaded through credential management, routing, and
/// dispatch. Surfaces on the OpenAI-compatible listener as an
/// `{"error": {code, message, details}}` envelope; the Gemini-native listener
/// converts it into [`crate::error::GeminiError`] instead.
#[derive(Debug, ThisError)]
pub enum GatewayError {
    #[error("Upstream error with status: {0}")]
    UpstreamStatus(StatusCode),

    #[error(transparent)]
    Oauth(#[from] OauthError),

    #[error("HTTP request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Stream protocol error: {0}")]
    StreamProtocolError(String),

    #[error("Missing access token; refresh first")]
    MissingAccessToken,

    #[error("Missing expiry; refresh first")]
    MissingExpiry,

    #[error("Unexpected error: {0}")]
    UnexpectedError(String),

    #[error("No available credential")]
    NoAvailableCredential,

    #[error("Background task error: {0}")]
    TaskError(String),

    #[error(transparent)]
    Storage(#[from] super::storage::StorageError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl From<JsonRejection> for GatewayError {
    fn from(rejection: JsonRejection) -> Self {
        GatewayError::InvalidRequest(rejection.body_text())
    }
}

/// The OpenAI-compatible listener dispatches through the same Gemini-shaped
/// upstream path as the Gemini-native one; this converts the dispatcher's
/// `GeminiError` back into the OpenAI error envelope rather than leaking a
/// Gemini-style `{error:{code,status}}` body onto an OpenAI-speaking caller.
impl From<super::GeminiError> for GatewayError {
    fn from(err: super::GeminiError) -> Self {
        use super::GeminiError;
        match err {
            GeminiError::NoAvailableCredential => GatewayError::NoAvailableCredential,
            GeminiError::Reqwest(e) => GatewayError::ReqwestError(e),
            GeminiError::StreamProtocolError(s) => GatewayError::StreamProtocolError(s),
            GeminiError::RequestRejected { body, .. } => GatewayError::InvalidRequest(body.message),
            GeminiError::UpstreamMappedError { status, .. } | GeminiError::UpstreamFallbackError { status, .. } => {
                GatewayError::UpstreamStatus(status)
            }
            GeminiError::Internal(s) => GatewayError::UnexpectedError(s),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_body) = match self {
            GatewayError::TaskError(_)
            | GatewayError::UnexpectedError(_)
            | GatewayError::Oauth(OauthError::Other { .. })
            | GatewayError::IoError(_)
            | GatewayError::MissingAccessToken
            | GatewayError::MissingExpiry
            | GatewayError::Storage(_) => {
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                let body = ApiErrorObject {
                    error_type: "api_error".to_string(),
                    code: "INTERNAL_ERROR".to_string(),
                    message: "An internal server error occurred.".to_string(),
                    details: None,
                };
                (status, body)
            }

            GatewayError::Oauth(OauthError::Flow {
                code,
                message,
                details,
            }) => {
                let status = StatusCode::FORBIDDEN;
                let body = ApiErrorObject {
                    error_type: "permission_error".to_string(),
                    code,
                    message,
                    details,
                };
                (status, body)
            }

            GatewayError::JsonError(_) | GatewayError::Oauth(OauthError::Parse { .. }) => {
                let status = StatusCode::BAD_GATEWAY;
                let body = ApiErrorObject {
                    error_type: "upstream_error".to_string(),
                    code: "BAD_UPSTREAM_PAYLOAD".to_string(),
                    message: "Failed to parse upstream response.".to_string(),
                    details: None,
                };
                (status, body)
            }

            GatewayError::StreamProtocolError(_)
            | GatewayError::Oauth(OauthError::Request(_))
            | GatewayError::Oauth(OauthError::ServerResponse { .. })
            | GatewayError::ReqwestError(_)
            | GatewayError::UrlError(_) => {
                let status = StatusCode::BAD_GATEWAY;
                let body = ApiErrorObject {
                    error_type: "upstream_error".to_string(),
                    code: "UPSTREAM_ERROR".to_string(),
                    message: "Upstream service error.".to_string(),
                    details: None,
                };
                (status, body)
            }

            GatewayError::NoAvailableCredential => {
                let status = StatusCode::SERVICE_UNAVAILABLE;
                let body = ApiErrorObject {
                    error_type: "no_credentials".to_string(),
                    code: "NO_CREDENTIAL".to_string(),
                    message: "No available credentials to process the request.".to_string(),
                    details: None,
                };
                (status, body)
            }

            GatewayError::InvalidRequest(detail) => {
                let status = StatusCode::BAD_REQUEST;
                let body = ApiErrorObject {
                    error_type: "invalid_request_error".to_string(),
                    code: "INVALID_REQUEST".to_string(),
                    message: detail,
                    details: None,
                };
                (status, body)
            }

            GatewayError::Unauthorized(detail) => {
                let status = StatusCode::UNAUTHORIZED;
                let body = ApiErrorObject {
                    error_type: "authentication_error".to_string(),
                    code: "UNAUTHORIZED".to_string(),
                    message: detail,
                    details: None,
                };
                (status, body)
            }

            GatewayError::UpstreamStatus(code)
            | GatewayError::Oauth(OauthError::UpstreamStatus(code)) => {
                let (err_type, err_code, msg) = match code {
                    StatusCode::TOO_MANY_REQUESTS => {
                        ("rate_limited", "RATE_LIMIT", "Upstream rate limit exceeded.")
                    }
                    StatusCode::UNAUTHORIZED => {
                        ("upstream_auth", "UNAUTHORIZED", "Upstream authentication failed.")
                    }
                    StatusCode::FORBIDDEN => {
                        ("upstream_auth", "FORBIDDEN", "Upstream permission denied.")
                    }
                    StatusCode::NOT_FOUND => ("not_found", "NOT_FOUND", "Upstream resource not found."),
                    _ => ("upstream_error", "UPSTREAM_ERROR", "An upstream error occurred."),
                };
                (
                    code,
                    ApiErrorObject {
                        error_type: err_type.to_string(),
                        code: err_code.to_string(),
                        message: msg.to_string(),
                        details: None,
                    },
                )
            }
        };
        (status, Json(ApiErrorBody { inner: error_body })).into_response()
    }
}

/// Standardized API error response payload (OpenAI-compatible listener).
#[derive(Serialize)]
pub struct ApiErrorObject {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Serialize)]
pub struct ApiErrorBody {
    #[serde(rename = "error")]
    pub inner: ApiErrorObject,
}

impl IsRetryable for GatewayError {
    fn is_retryable(&self) -> bool {
        match self {
            GatewayError::ReqwestError(_) => true,
            GatewayError::UpstreamStatus(status) => matches!(
                *status,
                reqwest::StatusCode::TOO_MANY_REQUESTS
                    | reqwest::StatusCode::UNAUTHORIZED
                    | reqwest::StatusCode::FORBIDDEN
                    | reqwest::StatusCode::NOT_FOUND
            ),
            GatewayError::Oauth(OauthError::ServerResponse { .. }) => false,
            GatewayError::UnexpectedError(_) => false,
            _ => false,
        }
    }
}
