use crate::utils::logging::with_pretty_json_debug;
use reqwest::StatusCode;
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;

/// Upper bound on how many bytes of an upstream error body are logged or
/// surfaced to callers.
pub const UPSTREAM_BODY_PREVIEW_CHARS: usize = 300;

/// Action the rotation loop and credential manager should take in response
/// to a classified upstream error.
#[derive(Debug, PartialEq, Eq)]
pub enum ActionForError {
    /// Rotate away from this credential for the given duration.
    RateLimit(Duration),
    /// Auto-ban this credential (subject to the manager's threshold rules).
    Ban,
    /// The credential itself is invalid (e.g. refresh token revoked).
    Invalid,
    /// The selected model is not available to this credential; try the next
    /// model in the fallback chain instead of rotating credentials.
    ModelUnsupported,
    /// No action; surface the error as-is.
    None,
}

/// Implemented by upstream error body shapes that can be pattern-matched
/// into an [`ActionForError`].
pub trait MappingAction: std::fmt::Debug + DeserializeOwned + Serialize {
    /// Inspect the parsed error body alongside the HTTP status for a
    /// specific, structured rule. Returns `None` to fall back to
    /// [`MappingAction::action_from_status`].
    fn try_match_rule(&self, status: StatusCode) -> Option<ActionForError>;

    /// Default status-only classification, used when the body didn't parse
    /// or didn't match a structured rule.
    fn action_from_status(status: StatusCode) -> ActionForError {
        match status {
            StatusCode::TOO_MANY_REQUESTS => ActionForError::RateLimit(Duration::from_secs(60)),
            StatusCode::FORBIDDEN => ActionForError::Ban,
            StatusCode::PAYMENT_REQUIRED => ActionForError::Ban,
            StatusCode::UNAUTHORIZED => ActionForError::Invalid,
            _ => ActionForError::None,
        }
    }
}

/// Classify an upstream HTTP response into an `(action, mapped_error)` pair.
///
/// Tries to parse the body as `E`; if that succeeds and a structured rule
/// matches, uses it. Otherwise falls back to status-only classification.
/// `map_raw` builds the caller's error type from the parsed body; `map_status`
/// builds it from the raw status + body text when parsing fails or no
/// structured rule matched.
pub async fn classify_upstream_error<E, MappedError>(
    resp: reqwest::Response,
    map_raw: impl FnOnce(E) -> MappedError,
    map_status: impl FnOnce(StatusCode, String) -> MappedError,
) -> (ActionForError, MappedError)
where
    E: MappingAction,
{
    let status = resp.status();
    let bytes = resp.bytes().await.unwrap_or_default();
    let raw_body_owned = String::from_utf8_lossy(&bytes).into_owned();

    if let Ok(error) = serde_json::from_slice::<E>(&bytes) {
        if let Some(action) = error.try_match_rule(status) {
            with_pretty_json_debug(&error, |pretty_error| {
                tracing::debug!(
                    %status,
                    ?action,
                    ?error,
                    body = %pretty_error,
                    "upstream structured error matched mapping rule"
                );
            });

            return (action, map_raw(error));
        }

        let action = E::action_from_status(status);

        with_pretty_json_debug(&error, |pretty_error| {
            tracing::debug!(
                %status,
                ?action,
                ?error,
                body = %pretty_error,
                "upstream structured error fell back to status mapping"
            );
        });

        return (action, map_status(status, raw_body_owned));
    }

    let action = E::action_from_status(status);

    tracing::debug!(
        %status,
        ?action,
        body = %format!("{:.len$}", raw_body_owned, len = UPSTREAM_BODY_PREVIEW_CHARS),
        "upstream unstructured error"
    );

    (action, map_status(status, raw_body_owned))
}
