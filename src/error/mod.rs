mod gemini;
mod oauth;
mod openai;
mod storage;

pub use gemini::{GeminiError, GeminiErrorBody, GeminiErrorObject, UpstreamErrorBody, UpstreamErrorObject};
pub use oauth::OauthError;
pub use openai::{ApiErrorBody, ApiErrorObject, GatewayError};
pub use storage::StorageError;

/// Whether an error represents a condition worth retrying by re-dispatching
/// to another credential (the dispatcher's rotation loop, not a generic
/// transport-level retry).
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}
