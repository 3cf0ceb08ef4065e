use super::IsRetryable;
use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error as ThisError;

use crate::dispatch::policy::{ActionForError, MappingAction, UPSTREAM_BODY_PREVIEW_CHARS};

/// Error surfaced on the Gemini-native listener, always rendered as a
/// `{"error": {code, message, status}}` envelope.
#[derive(Debug, ThisError)]
pub enum GeminiError {
    #[error("Request rejected")]
    RequestRejected {
        status: StatusCode,
        body: GeminiErrorObject,
        debug_message: Option<String>,
    },

    /// No usable credential is currently available.
    #[error("No available credential")]
    NoAvailableCredential,

    /// Upstream error that matched a mapping rule.
    #[error("Upstream mapped error: status={status} body={body:?}")]
    UpstreamMappedError {
        status: StatusCode,
        body: UpstreamErrorBody,
    },

    /// Upstream fallback error (rule unmatched or body unstructured).
    #[error("Upstream fallback error: status={status}, body={body:.200}")]
    UpstreamFallbackError {
        status: StatusCode,
        /// Raw upstream body, preserved for internal diagnostics/logging only.
        body: String,
    },

    /// Transport-level failure (DNS, connect, timeouts, etc).
    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Stream protocol error: {0}")]
    StreamProtocolError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<JsonRejection> for GeminiError {
    fn from(rejection: JsonRejection) -> Self {
        let debug_message = rejection.to_string();
        match rejection {
            JsonRejection::JsonSyntaxError(_) => GeminiError::RequestRejected {
                status: StatusCode::BAD_REQUEST,
                body: GeminiErrorObject::for_status(
                    StatusCode::BAD_REQUEST,
                    "INVALID_ARGUMENT",
                    "invalid JSON",
                ),
                debug_message: Some(debug_message),
            },
            _ => GeminiError::RequestRejected {
                status: StatusCode::BAD_REQUEST,
                body: GeminiErrorObject::for_status(
                    StatusCode::BAD_REQUEST,
                    "INVALID_ARGUMENT",
                    "invalid request",
                ),
                debug_message: Some(debug_message),
            },
        }
    }
}

impl IntoResponse for GeminiError {
    fn into_response(self) -> Response {
        let (status, error_body) = match self {
            GeminiError::RequestRejected {
                status,
                body,
                debug_message,
            } => {
                if let Some(debug_message) = debug_message {
                    tracing::warn!(
                        status = %status,
                        code = body.code,
                        err_status = %body.status,
                        message = %body.message,
                        debug_message = %debug_message,
                        "gemini request rejected"
                    );
                } else {
                    tracing::warn!(
                        status = %status,
                        code = body.code,
                        err_status = %body.status,
                        message = %body.message,
                        "gemini request rejected"
                    );
                }
                (status, body)
            }

            GeminiError::UpstreamMappedError { status, body } => {
                let cleaned = GeminiErrorBody::from(body).inner;
                tracing::warn!(
                    status = %status,
                    code = cleaned.code,
                    err_status = %cleaned.status,
                    message = %cleaned.message,
                    "gemini upstream mapped error"
                );
                (status, cleaned)
            }

            GeminiError::UpstreamFallbackError { status, body } => {
                let status_str = match status {
                    StatusCode::TOO_MANY_REQUESTS => "RESOURCE_EXHAUSTED",
                    StatusCode::UNAUTHORIZED => "UNAUTHENTICATED",
                    StatusCode::FORBIDDEN => "PERMISSION_DENIED",
                    StatusCode::NOT_FOUND => "NOT_FOUND",
                    _ => "UNKNOWN",
                };
                tracing::warn!(
                    status = %status,
                    raw_body = %format!("{:.len$}", body, len = UPSTREAM_BODY_PREVIEW_CHARS),
                    "gemini upstream fallback error"
                );
                (
                    status,
                    GeminiErrorObject::for_status(
                        status,
                        status_str,
                        format!("Upstream returned {status}"),
                    ),
                )
            }

            GeminiError::NoAvailableCredential => (
                StatusCode::SERVICE_UNAVAILABLE,
                GeminiErrorObject::for_status(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "UNAVAILABLE",
                    "No available credentials to process the request.",
                ),
            ),

            GeminiError::Reqwest(e) => {
                tracing::warn!(error = %e, status = ?e.status(), "gemini reqwest error");
                (
                    StatusCode::BAD_GATEWAY,
                    GeminiErrorObject::for_status(
                        StatusCode::BAD_GATEWAY,
                        "UNAVAILABLE",
                        "Upstream service error.",
                    ),
                )
            }

            GeminiError::StreamProtocolError(e) => {
                tracing::warn!(error = %e, "gemini stream protocol error");
                (
                    StatusCode::BAD_GATEWAY,
                    GeminiErrorObject::for_status(
                        StatusCode::BAD_GATEWAY,
                        "UNAVAILABLE",
                        "Upstream stream protocol error.",
                    ),
                )
            }

            GeminiError::Internal(e) => {
                tracing::error!(error = %e, "gemini internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    GeminiErrorObject::for_status(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL",
                        "An internal server error occurred.",
                    ),
                )
            }
        };

        let resp_json = GeminiErrorBody { inner: error_body };
        (status, Json(resp_json)).into_response()
    }
}

impl From<crate::error::GatewayError> for GeminiError {
    fn from(err: crate::error::GatewayError) -> Self {
        use crate::error::GatewayError;
        match err {
            GatewayError::NoAvailableCredential => GeminiError::NoAvailableCredential,
            GatewayError::ReqwestError(e) => GeminiError::Reqwest(e),
            GatewayError::StreamProtocolError(s) => GeminiError::StreamProtocolError(s),
            other => GeminiError::Internal(other.to_string()),
        }
    }
}

impl IsRetryable for GeminiError {
    fn is_retryable(&self) -> bool {
        match self {
            // Transport errors are already retried inside the dispatcher's HTTP call.
            GeminiError::Reqwest(_) => false,

            GeminiError::UpstreamFallbackError { status, .. } => matches!(
                *status,
                StatusCode::TOO_MANY_REQUESTS
                    | StatusCode::UNAUTHORIZED
                    | StatusCode::FORBIDDEN
                    | StatusCode::NOT_FOUND
            ),

            GeminiError::UpstreamMappedError { status, .. } => matches!(
                *status,
                StatusCode::TOO_MANY_REQUESTS
                    | StatusCode::UNAUTHORIZED
                    | StatusCode::FORBIDDEN
                    | StatusCode::NOT_FOUND
            ),

            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GeminiErrorBody {
    #[serde(rename = "error")]
    pub inner: GeminiErrorObject,
}

#[derive(Debug, Serialize)]
pub struct GeminiErrorObject {
    pub code: u16,
    pub message: String,
    pub status: String,
}

impl GeminiErrorObject {
    pub(crate) fn for_status(
        code: StatusCode,
        status: &'static str,
        message: impl Into<String>,
    ) -> Self {
        GeminiErrorObject {
            code: code.as_u16(),
            message: message.into(),
            status: status.to_string(),
        }
    }
}

impl From<UpstreamErrorBody> for GeminiErrorBody {
    fn from(upstream_err: UpstreamErrorBody) -> Self {
        let UpstreamErrorBody { inner } = upstream_err;
        let UpstreamErrorObject {
            code,
            message,
            status,
            details: _,
            extra: _,
        } = inner;
        GeminiErrorBody {
            inner: GeminiErrorObject {
                code: code.unwrap_or(0),
                message: message.filter(|s| !s.trim().is_empty()).unwrap_or_else(|| {
                    "Upstream error (check server logs for details).".to_string()
                }),
                status: status
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "UNKNOWN".to_string()),
            },
        }
    }
}

/// Code Assist upstream error response shape.
#[derive(Debug, Deserialize, Serialize)]
pub struct UpstreamErrorBody {
    #[serde(rename = "error")]
    pub inner: UpstreamErrorObject,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UpstreamErrorObject {
    /// Numeric error code returned by upstream (often equals the HTTP status, e.g. `429`/`404`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,

    /// Human-readable error message from upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Upstream status string (Google-style canonical status name, e.g.
    /// `"RESOURCE_EXHAUSTED"`, `"NOT_FOUND"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Structured error details array. Present on some errors (notably
    /// `429`) and may include `google.rpc.ErrorInfo`/`RetryInfo` objects
    /// carrying `quotaResetTimeStamp`/`retryDelay`. Kept as raw `Value` for
    /// forward compatibility; only `quotaResetTimeStamp` is interpreted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<Value>>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl UpstreamErrorBody {
    pub fn quota_reset_delay(&self) -> Option<u64> {
        let details = self.inner.details.as_ref()?;

        details
            .iter()
            .filter_map(|detail| {
                detail
                    .get("metadata")
                    .and_then(|m| m.get("quotaResetTimeStamp"))
                    .and_then(Value::as_str)
                    .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            })
            .filter_map(|reset_dt| {
                let reset = reset_dt.with_timezone(&Utc);
                let now = Utc::now();
                let diff_secs = (reset - now).num_seconds();
                (diff_secs > 0).then_some((diff_secs as u64).saturating_add(1))
            })
            .next()
            .or_else(|| {
                details
                    .iter()
                    .any(|detail| {
                        detail.get("reason").and_then(Value::as_str)
                            == Some("MODEL_CAPACITY_EXHAUSTED")
                    })
                    .then_some(60 * 60)
            })
    }
}

impl MappingAction for UpstreamErrorBody {
    fn try_match_rule(&self, status: StatusCode) -> Option<ActionForError> {
        match (status, self) {
            (StatusCode::UNAUTHORIZED, body)
                if body.inner.status.as_deref() == Some("UNAUTHENTICATED") =>
            {
                Some(ActionForError::Invalid)
            }

            (StatusCode::FORBIDDEN, body)
                if body.inner.status.as_deref() == Some("PERMISSION_DENIED") =>
            {
                Some(ActionForError::Ban)
            }

            (StatusCode::NOT_FOUND, body) if body.inner.status.as_deref() == Some("NOT_FOUND") => {
                Some(ActionForError::ModelUnsupported)
            }

            (StatusCode::TOO_MANY_REQUESTS, body)
                if body.inner.status.as_deref() == Some("RESOURCE_EXHAUSTED") =>
            {
                Some(ActionForError::RateLimit(Duration::from_secs(
                    body.quota_reset_delay().unwrap_or(90).max(1),
                )))
            }

            _ => None,
        }
    }

    fn action_from_status(status: StatusCode) -> ActionForError {
        match status {
            StatusCode::UNAUTHORIZED => ActionForError::Invalid,
            StatusCode::FORBIDDEN => ActionForError::None,
            StatusCode::NOT_FOUND => ActionForError::ModelUnsupported,
            StatusCode::TOO_MANY_REQUESTS => ActionForError::RateLimit(Duration::from_secs(60)),
            _ => ActionForError::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_and_map() {
        let e429_1 = UpstreamErrorBody {
            inner: UpstreamErrorObject {
                code: Some(429),
                message: Some("quota".to_string()),
                status: Some("RESOURCE_EXHAUSTED".to_string()),
                details: Some(vec![json!({
                    "@type": "type.googleapis.com/google.rpc.ErrorInfo",
                    "reason": "QUOTA_EXHAUSTED",
                    "domain": "cloudcode-pa.googleapis.com",
                    "metadata": {
                        "uiMessage": "true",
                        "model": "gemini-2.5-pro",
                        "quotaResetDelay": "5h41m27.587942796s",
                        "quotaResetTimeStamp": "2999-01-01T00:00:00Z"
                    }
                })]),
                extra: BTreeMap::new(),
            },
        };
        assert_eq!(e429_1.inner.code, Some(429));
        assert_eq!(e429_1.inner.status.as_deref(), Some("RESOURCE_EXHAUSTED"));
        assert!(e429_1.inner.details.is_some());
        assert!(matches!(
            e429_1.try_match_rule(StatusCode::TOO_MANY_REQUESTS),
            Some(ActionForError::RateLimit(_))
        ));

        let e429_2 = UpstreamErrorBody {
            inner: UpstreamErrorObject {
                code: Some(429),
                message: Some("No capacity".to_string()),
                status: Some("RESOURCE_EXHAUSTED".to_string()),
                details: Some(vec![json!({
                    "@type": "type.googleapis.com/google.rpc.ErrorInfo",
                    "domain": "cloudcode-pa.googleapis.com",
                    "metadata": { "model": "gemini-3-pro-preview" },
                    "reason": "MODEL_CAPACITY_EXHAUSTED"
                })]),
                extra: BTreeMap::new(),
            },
        };
        assert_eq!(e429_2.inner.code, Some(429));
        assert_eq!(e429_2.inner.status.as_deref(), Some("RESOURCE_EXHAUSTED"));
        assert!(e429_2.inner.details.is_some());
        assert_eq!(
            e429_2.try_match_rule(StatusCode::TOO_MANY_REQUESTS),
            Some(ActionForError::RateLimit(Duration::from_secs(60 * 60)))
        );

        let e404_1 = UpstreamErrorBody {
            inner: UpstreamErrorObject {
                code: Some(404),
                message: Some("Requested entity was not found.".to_string()),
                status: Some("NOT_FOUND".to_string()),
                details: None,
                extra: BTreeMap::new(),
            },
        };
        assert_eq!(e404_1.inner.code, Some(404));
        assert_eq!(e404_1.inner.status.as_deref(), Some("NOT_FOUND"));
        assert!(matches!(
            e404_1.try_match_rule(StatusCode::NOT_FOUND),
            Some(ActionForError::ModelUnsupported)
        ));
    }

    #[test]
    fn quota_reset_delay_uses_timestamp() {
        let raw = r#"{
            "error": {
                "code": 429,
                "message": "quota",
                "status": "RESOURCE_EXHAUSTED",
                "details": [
                    { "metadata": { "quotaResetTimeStamp": "2999-01-01T00:00:00Z" } }
                ]
            }
        }"#;

        let parsed = serde_json::from_str::<UpstreamErrorBody>(raw).expect("parse sample");
        assert!(parsed.quota_reset_delay().is_some());
    }
}
