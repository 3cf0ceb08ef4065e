//! The upstream dispatcher: owns the rotation loop described in spec §4.4
//! (Selecting → Executing → Succeeded | Failing → {Succeeded,
//! ExhaustedRotations}) and the four Code Assist operations built on top of
//! it — `generate`, `stream`, `count_tokens`, and `action`.

use super::anti_truncation;
use super::client::ClientCache;
use super::policy::{self, ActionForError, MappingAction};
use super::sse::{self, StreamItem};
use crate::config::{DispatchConfig, GeminiCliConfig};
use crate::credential::{Credential, CredentialManager};
use crate::error::{GatewayError, GeminiError, UpstreamErrorBody};
use crate::routing::{PickInfo, PickReason, RoutingStrategy};
use axum::http::StatusCode;
use futures::Stream;
use gateway_schema::{CodeAssistRequestMeta, CodeAssistResponseBody, GeminiGenerateContentRequest, GeminiResponseBody};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const GENERATE_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal:generateContent";
const STREAM_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse";
const COUNT_TOKENS_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal:countTokens";

fn action_url(name: &str) -> String {
    format!("https://cloudcode-pa.googleapis.com/v1internal:{name}")
}

/// Which base model and credential ultimately served a request, surfaced
/// for access logging and metrics.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub model_used: String,
    pub credential_id: String,
    pub rotations: u32,
}

/// What the rotation loop does with a classified failure.
enum RotationDecision {
    RotateCredential,
    NextModel,
    Surface,
}

fn decide(status: Option<StatusCode>, action: &ActionForError, retry_on_5xx: bool) -> RotationDecision {
    let Some(status) = status else {
        return RotationDecision::RotateCredential;
    };
    match action {
        ActionForError::ModelUnsupported => RotationDecision::NextModel,
        ActionForError::RateLimit(_) | ActionForError::Ban | ActionForError::Invalid => {
            RotationDecision::RotateCredential
        }
        ActionForError::None if status.is_server_error() && retry_on_5xx => RotationDecision::RotateCredential,
        ActionForError::None => RotationDecision::Surface,
    }
}

/// One rotation loop's exhaustion outcome: whether to try the next model in
/// the fallback chain or give up entirely.
enum RotateError {
    NextModel(GeminiError),
    Exhausted(GeminiError),
}

/// Outcome of one HTTP attempt against an already-selected, already-fresh
/// credential.
enum Attempt {
    Success(reqwest::Response),
    Failure {
        decision: RotationDecision,
        action: ActionForError,
        error: GeminiError,
    },
}

pub struct Dispatcher {
    manager: Arc<CredentialManager>,
    routing: Arc<RoutingStrategy>,
    clients: Arc<ClientCache>,
    config: DispatchConfig,
    geminicli: GeminiCliConfig,
}

impl Dispatcher {
    pub fn new(
        manager: Arc<CredentialManager>,
        routing: Arc<RoutingStrategy>,
        clients: Arc<ClientCache>,
        config: DispatchConfig,
        geminicli: GeminiCliConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            routing,
            clients,
            config,
            geminicli,
        })
    }

    /// Unary `generateContent`, with anti-truncation continuation applied
    /// when the model requests it.
    pub async fn generate(
        &self,
        model: &str,
        project: &str,
        sticky_id: Option<&str>,
        mut request: GeminiGenerateContentRequest,
    ) -> Result<(GeminiResponseBody, DispatchOutcome), GeminiError> {
        let wants_anti_truncation = self.config.wants_anti_truncation(model);
        if wants_anti_truncation {
            anti_truncation::inject_sentinel(&mut request, &self.config.anti_truncation_sentinel);
        }

        let timeout = Duration::from_secs(self.config.generate_timeout_secs);
        let (mut body, outcome) = self.generate_with_fallback(model, project, sticky_id, &request, timeout).await?;

        if wants_anti_truncation {
            self.continue_until_complete(project, &outcome.model_used, sticky_id, &request, &mut body, timeout)
                .await;
            anti_truncation::strip_sentinel(&mut body, &self.config.anti_truncation_sentinel);
        }

        Ok((body, outcome))
    }

    /// Re-issues unary calls appending continuation text until the sentinel
    /// is found or `anti_truncation_max_attempts` is reached.
    async fn continue_until_complete(
        &self,
        project: &str,
        model: &str,
        sticky_id: Option<&str>,
        original_request: &GeminiGenerateContentRequest,
        body: &mut GeminiResponseBody,
        timeout: Duration,
    ) {
        let sentinel = &self.config.anti_truncation_sentinel;
        let mut attempts = 0;
        while anti_truncation::is_truncated(body, sentinel) && attempts < self.config.anti_truncation_max_attempts {
            attempts += 1;
            let continuation_request = original_request.clone();
            match self
                .rotate_model(model, project, sticky_id, &continuation_request, timeout, GENERATE_URL)
                .await
            {
                Ok((raw, _meta)) => {
                    let envelope: CodeAssistResponseBody = match serde_json::from_value(raw) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(error = %e, "anti-truncation continuation body failed to parse");
                            break;
                        }
                    };
                    let continuation_body: GeminiResponseBody = envelope.into();
                    let Some(text) = continuation_text(&continuation_body) else {
                        break;
                    };
                    anti_truncation::append_continuation(body, &text);
                }
                Err(_) => break,
            }
        }
    }

    /// `streamGenerateContent`, either a real upstream SSE pass-through or a
    /// synthetic stream built from a unary call, depending on
    /// `dispatch.fake_stream_models`. Returns a schema-agnostic item stream
    /// rather than a built `Sse` response so each listener can render the
    /// items in its own wire format (Gemini-native vs. OpenAI chunks)
    /// without re-parsing upstream bytes twice.
    pub async fn stream(
        &self,
        model: &str,
        project: &str,
        sticky_id: Option<&str>,
        request: GeminiGenerateContentRequest,
    ) -> Result<(impl Stream<Item = Result<StreamItem, GeminiError>>, DispatchOutcome), GeminiError> {
        if self.config.wants_fake_stream(model) {
            let (body, outcome) = self.generate(model, project, sticky_id, request).await?;
            let items = sse::fake_typed_stream(
                body,
                self.config.fake_stream_chunk_size,
                Duration::from_millis(self.config.fake_stream_delay_ms),
            );
            return Ok((futures::stream::StreamExt::left_stream(items), outcome));
        }

        let timeout = Duration::from_secs(self.config.stream_timeout_secs);
        let (response, outcome) = self
            .rotate_with_fallback_raw(model, project, sticky_id, &request, timeout, STREAM_URL)
            .await?;
        let items = sse::build_typed_stream(response, timeout);
        Ok((futures::stream::StreamExt::right_stream(items), outcome))
    }

    /// `countTokens`.
    pub async fn count_tokens(
        &self,
        model: &str,
        project: &str,
        sticky_id: Option<&str>,
        request: GeminiGenerateContentRequest,
    ) -> Result<(Value, DispatchOutcome), GeminiError> {
        let timeout = Duration::from_secs(self.config.short_op_timeout_secs);
        self.rotate_model(model, project, sticky_id, &request, timeout, COUNT_TOKENS_URL)
            .await
            .map_err(rotate_error_into_gemini)
    }

    /// An internal Code Assist action (`loadCodeAssist`, `onboardUser`, ...)
    /// that isn't shaped like `generateContent`.
    pub async fn action(
        &self,
        name: &str,
        sticky_id: Option<&str>,
        payload: Value,
    ) -> Result<(Value, DispatchOutcome), GeminiError> {
        let timeout = Duration::from_secs(self.config.short_op_timeout_secs);
        let url = action_url(name);
        let (response, meta) = self
            .rotate_credential(sticky_id, timeout, &url, &payload)
            .await
            .map_err(rotate_error_into_gemini)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(GeminiError::Reqwest)?;
        let value = serde_json::from_slice(&bytes).map_err(|e| GeminiError::UpstreamFallbackError {
            status,
            body: format!("failed to parse success body: {e}"),
        })?;

        Ok((
            value,
            DispatchOutcome {
                model_used: name.to_string(),
                credential_id: meta.credential_id,
                rotations: meta.rotations,
            },
        ))
    }

    async fn generate_with_fallback(
        &self,
        model: &str,
        project: &str,
        sticky_id: Option<&str>,
        request: &GeminiGenerateContentRequest,
        timeout: Duration,
    ) -> Result<(GeminiResponseBody, DispatchOutcome), GeminiError> {
        let (raw, outcome) = self
            .rotate_model(model, project, sticky_id, request, timeout, GENERATE_URL)
            .await
            .map_err(rotate_error_into_gemini)?;
        let envelope: CodeAssistResponseBody = serde_json::from_value(raw)
            .map_err(|e| GeminiError::Internal(format!("malformed upstream response: {e}")))?;
        Ok((envelope.into(), outcome))
    }

    /// Iterates `model`'s fallback chain, running a full credential rotation
    /// loop per entry; the first attempt to return a 2xx wins.
    async fn rotate_model(
        &self,
        model: &str,
        project: &str,
        sticky_id: Option<&str>,
        request: &GeminiGenerateContentRequest,
        timeout: Duration,
        url: &str,
    ) -> Result<(Value, DispatchOutcome), RotateError> {
        let (response, outcome) = self
            .rotate_with_fallback_for_body(model, project, sticky_id, request, timeout, url)
            .await?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RotateError::Exhausted(GeminiError::Reqwest(e)))?;
        let value = serde_json::from_slice(&bytes).map_err(|e| {
            RotateError::Exhausted(GeminiError::UpstreamFallbackError {
                status,
                body: format!("failed to parse success body: {e}"),
            })
        })?;
        Ok((value, outcome))
    }

    async fn rotate_with_fallback_raw(
        &self,
        model: &str,
        project: &str,
        sticky_id: Option<&str>,
        request: &GeminiGenerateContentRequest,
        timeout: Duration,
        url: &str,
    ) -> Result<(reqwest::Response, DispatchOutcome), GeminiError> {
        self.rotate_with_fallback_for_body(model, project, sticky_id, request, timeout, url)
            .await
            .map_err(rotate_error_into_gemini)
    }

    async fn rotate_with_fallback_for_body(
        &self,
        model: &str,
        project: &str,
        sticky_id: Option<&str>,
        request: &GeminiGenerateContentRequest,
        timeout: Duration,
        url: &str,
    ) -> Result<(reqwest::Response, DispatchOutcome), RotateError> {
        let chain = self.config.fallback_chain_for(model);
        let mut last_err = None;

        for candidate_model in chain {
            let body = CodeAssistRequestMeta {
                model: candidate_model.to_string(),
                project: project.to_string(),
            }
            .into_request(request.clone());

            match self.rotate_credential(sticky_id, timeout, url, &body).await {
                Ok((response, meta)) => {
                    return Ok((
                        response,
                        DispatchOutcome {
                            model_used: candidate_model.to_string(),
                            credential_id: meta.credential_id,
                            rotations: meta.rotations,
                        },
                    ));
                }
                Err(RotateError::NextModel(e)) => {
                    last_err = Some(e);
                    continue;
                }
                Err(RotateError::Exhausted(e)) => {
                    last_err = Some(e);
                    continue;
                }
            }
        }

        Err(RotateError::Exhausted(last_err.unwrap_or(GeminiError::NoAvailableCredential)))
    }

    /// Selects the next credential, falling back to the credential
    /// manager's brief-sleep-and-retry when the routing strategy's
    /// synchronous scan finds nothing eligible (e.g. everything momentarily
    /// cooled down) — the async counterpart of what used to be
    /// `RoutingStrategy::pick_with_info`'s own fallback branch.
    async fn select_credential(&self, sticky_id: Option<&str>) -> Result<(Arc<Credential>, PickInfo), GatewayError> {
        match self.routing.pick_with_info(sticky_id) {
            Ok(picked) => Ok(picked),
            Err(_) => {
                let cred = self.manager.get_credential().await?;
                Ok((
                    cred.clone(),
                    PickInfo {
                        credential_id: cred.id.clone(),
                        reason: PickReason::ManagerFallback,
                        sticky_source: None,
                    },
                ))
            }
        }
    }

    /// Runs one HTTP attempt against `cred`, classifying the outcome and
    /// recording its success/failure against both the credential manager
    /// and the routing strategy.
    async fn attempt<Req: Serialize>(&self, cred: &Arc<Credential>, timeout: Duration, url: &str, body: &Req) -> Attempt {
        let client = match self.clients.get_or_create(cred) {
            Ok(c) => c,
            Err(e) => {
                return Attempt::Failure {
                    decision: RotationDecision::RotateCredential,
                    action: ActionForError::None,
                    error: GeminiError::from(e),
                };
            }
        };

        match tokio::time::timeout(timeout, client.post(url).json(body).send()).await {
            Ok(Ok(response)) if response.status().is_success() => {
                self.manager.mark_success(cred);
                self.routing.on_result(&cred.id, Some(response.status().as_u16()));
                Attempt::Success(response)
            }
            Ok(Ok(response)) => {
                let status = response.status();
                let (action, mapped) = policy::classify_upstream_error::<UpstreamErrorBody, _>(
                    response,
                    |body| GeminiError::UpstreamMappedError { status, body },
                    |status, body| GeminiError::UpstreamFallbackError { status, body },
                )
                .await;

                self.apply_failure(cred, Some(status), &action);
                let decision = decide(Some(status), &action, self.config.retry_on_5xx);
                Attempt::Failure { decision, action, error: mapped }
            }
            Ok(Err(e)) => {
                self.clients.invalidate(&cred.id);
                self.apply_failure(cred, None, &ActionForError::None);
                Attempt::Failure {
                    decision: RotationDecision::RotateCredential,
                    action: ActionForError::None,
                    error: GeminiError::Reqwest(e),
                }
            }
            Err(_elapsed) => {
                self.apply_failure(cred, None, &ActionForError::None);
                Attempt::Failure {
                    decision: RotationDecision::RotateCredential,
                    action: ActionForError::None,
                    error: GeminiError::StreamProtocolError("upstream call timed out".into()),
                }
            }
        }
    }

    /// The core credential-rotation state machine: Selecting → Executing →
    /// Succeeded | Failing → {Succeeded, ExhaustedRotations}, per spec §4.4.
    ///
    /// A failure classified as `ActionForError::Invalid` (access token
    /// rejected outright) gets one forced refresh and retry on the *same*
    /// credential before the loop rotates away from it — spec §4.4 "401/403
    /// if refresh was not tried" and §7's `upstream_auth` row.
    async fn rotate_credential<Req: Serialize>(
        &self,
        sticky_id: Option<&str>,
        timeout: Duration,
        url: &str,
        body: &Req,
    ) -> Result<(reqwest::Response, RotationMeta), RotateError> {
        let mut sticky = sticky_id.map(str::to_string);
        let mut last_err = None;

        for rotation in 0..self.config.max_rotations {
            let (cred, _info) = self
                .select_credential(sticky.as_deref())
                .await
                .map_err(|e| RotateError::Exhausted(GeminiError::from(e)))?;
            sticky = None;

            let _guard = cred.acquire();
            if let Err(e) = self.manager.ensure_fresh(&cred).await {
                self.routing.on_result(&cred.id, None);
                last_err = Some(GeminiError::from(e));
                continue;
            }

            let mut outcome = self.attempt(&cred, timeout, url, body).await;
            if let Attempt::Failure { action: ActionForError::Invalid, .. } = &outcome {
                if self.manager.force_refresh(&cred).await.is_ok() {
                    outcome = self.attempt(&cred, timeout, url, body).await;
                }
            }

            match outcome {
                Attempt::Success(response) => {
                    return Ok((
                        response,
                        RotationMeta {
                            credential_id: cred.id.clone(),
                            rotations: rotation + 1,
                        },
                    ));
                }
                Attempt::Failure { decision, error, .. } => match decision {
                    RotationDecision::RotateCredential => {
                        last_err = Some(error);
                        continue;
                    }
                    RotationDecision::NextModel => return Err(RotateError::NextModel(error)),
                    RotationDecision::Surface => return Err(RotateError::Exhausted(error)),
                },
            }
        }

        Err(RotateError::Exhausted(
            last_err.unwrap_or(GeminiError::NoAvailableCredential),
        ))
    }

    fn apply_failure(&self, cred: &Arc<Credential>, status: Option<StatusCode>, action: &ActionForError) {
        self.manager.mark_failure(cred, status);
        self.routing.on_result(&cred.id, status.map(|s| s.as_u16()));
        if let ActionForError::RateLimit(duration) = action {
            self.routing.cooldown_for(&cred.id, *duration);
        }
        if matches!(action, ActionForError::Invalid) {
            self.clients.invalidate(&cred.id);
        }
    }
}

struct RotationMeta {
    credential_id: String,
    rotations: u32,
}

fn rotate_error_into_gemini(err: RotateError) -> GeminiError {
    match err {
        RotateError::NextModel(e) | RotateError::Exhausted(e) => e,
    }
}

fn continuation_text(body: &GeminiResponseBody) -> Option<String> {
    let candidate = body.candidates.last()?;
    let content = candidate.content.as_ref()?;
    let text: String = content.parts.iter().filter_map(|p| p.text.as_deref()).collect();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_unsupported_moves_to_next_model() {
        let decision = decide(Some(StatusCode::NOT_FOUND), &ActionForError::ModelUnsupported, true);
        assert!(matches!(decision, RotationDecision::NextModel));
    }

    #[test]
    fn rate_limit_rotates_credential() {
        let decision = decide(Some(StatusCode::TOO_MANY_REQUESTS), &ActionForError::RateLimit(Duration::from_secs(1)), true);
        assert!(matches!(decision, RotationDecision::RotateCredential));
    }

    #[test]
    fn bad_request_surfaces_immediately() {
        let decision = decide(Some(StatusCode::BAD_REQUEST), &ActionForError::None, true);
        assert!(matches!(decision, RotationDecision::Surface));
    }

    #[test]
    fn server_error_rotates_when_enabled() {
        let decision = decide(Some(StatusCode::INTERNAL_SERVER_ERROR), &ActionForError::None, true);
        assert!(matches!(decision, RotationDecision::RotateCredential));
    }

    #[test]
    fn server_error_surfaces_when_retry_disabled() {
        let decision = decide(Some(StatusCode::INTERNAL_SERVER_ERROR), &ActionForError::None, false);
        assert!(matches!(decision, RotationDecision::Surface));
    }

    #[test]
    fn network_failure_always_rotates() {
        let decision = decide(None, &ActionForError::None, false);
        assert!(matches!(decision, RotationDecision::RotateCredential));
    }
}
