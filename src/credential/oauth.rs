//! Google OAuth2 token exchange and Code Assist onboarding calls. Only the
//! refresh-token grant is implemented; the interactive consent-screen flow
//! used to mint a credential in the first place is an external, out-of-band
//! concern and plays no part in the gateway's runtime.

use crate::error::OauthError;
use crate::types::google_code_assist::{LoadCodeAssistResponse, OnboardOperationResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const LOAD_CODE_ASSIST_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal:loadCodeAssist";
const ONBOARD_CODE_ASSIST_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal:onboardUser";
const CODE_ASSIST_USER_AGENT: &str = "google-api-nodejs-client/9.15.1";

/// Fallback OAuth application identity used for credentials that were
/// captured without their own client id/secret (the common case for
/// `gemini-cli`-style credential files, which are minted against Google's
/// published desktop-app OAuth client).
pub const GCLI_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
pub const GCLI_CLIENT_SECRET: &str = "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";

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    id_token: Option<String>,
}

/// Result of a successful refresh grant.
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// Email recovered from the refreshed id_token, if present, useful for
    /// admin-surface display.
    pub email: Option<String>,
}

/// Exchanges a refresh token for a new access token against `token_uri`,
/// falling back to the fixed gemini-cli OAuth app identity when the
/// credential doesn't carry its own `client_id`/`client_secret`.
pub async fn refresh_access_token(
    http: &reqwest::Client,
    token_uri: &str,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<RefreshedToken, OauthError> {
    let token_uri = if token_uri.is_empty() { GOOGLE_TOKEN_URI } else { token_uri };
    let client_id = if client_id.is_empty() { GCLI_CLIENT_ID } else { client_id };
    let client_secret = if client_secret.is_empty() { GCLI_CLIENT_SECRET } else { client_secret };

    let params = [
        ("client_id", client_id),
        ("client_secret", client_secret),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];

    let response = http.post(token_uri).form(&params).send().await.map_err(OauthError::Request)?;

    let status = response.status();
    let body = response.text().await.map_err(OauthError::Request)?;

    if !status.is_success() {
        return Err(OauthError::UpstreamStatus(status));
    }

    let parsed: RefreshResponse = serde_json::from_str(&body).map_err(|e| OauthError::Parse {
        message: e.to_string(),
        body: body.clone(),
    })?;

    let email = parsed
        .id_token
        .as_deref()
        .and_then(crate::utils::jwt::decode_jwt_claims)
        .and_then(|claims| claims.get("email").and_then(|v| v.as_str()).map(str::to_string));

    Ok(RefreshedToken {
        access_token: parsed.access_token,
        expires_at: Utc::now() + chrono::Duration::seconds(parsed.expires_in),
        email,
    })
}

/// Calls `loadCodeAssist`, used to discover the Cloud project a credential
/// is onboarded against (spec §2, "optional project-id resolution").
pub async fn load_code_assist(
    http: &reqwest::Client,
    access_token: &str,
) -> Result<LoadCodeAssistResponse, OauthError> {
    let response = http
        .post(LOAD_CODE_ASSIST_URL)
        .bearer_auth(access_token)
        .header("User-Agent", CODE_ASSIST_USER_AGENT)
        .json(&serde_json::json!({ "metadata": { "pluginType": "GEMINI" } }))
        .send()
        .await
        .map_err(OauthError::Request)?;

    let status = response.status();
    let body = response.text().await.map_err(OauthError::Request)?;
    if !status.is_success() {
        return Err(OauthError::UpstreamStatus(status));
    }
    serde_json::from_str(&body).map_err(|e| OauthError::Parse {
        message: e.to_string(),
        body,
    })
}

/// Calls `onboardUser` for `tier_id`/`project_id`, polling the long-running
/// operation until `done` or `timeout` elapses.
pub async fn onboard_user(
    http: &reqwest::Client,
    access_token: &str,
    tier_id: &str,
    project_id: Option<&str>,
    timeout: Duration,
) -> Result<OnboardOperationResponse, OauthError> {
    let mut body = serde_json::json!({
        "tierId": tier_id,
        "metadata": { "pluginType": "GEMINI" },
    });
    if let Some(project_id) = project_id {
        body["cloudaicompanionProject"] = serde_json::Value::String(project_id.to_string());
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let response = http
            .post(ONBOARD_CODE_ASSIST_URL)
            .bearer_auth(access_token)
            .header("User-Agent", CODE_ASSIST_USER_AGENT)
            .json(&body)
            .send()
            .await
            .map_err(OauthError::Request)?;

        let status = response.status();
        let text = response.text().await.map_err(OauthError::Request)?;
        if !status.is_success() {
            return Err(OauthError::UpstreamStatus(status));
        }

        let parsed: OnboardOperationResponse = serde_json::from_str(&text).map_err(|e| OauthError::Parse {
            message: e.to_string(),
            body: text.clone(),
        })?;

        if parsed.done {
            return Ok(parsed);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(OauthError::Other {
                message: "onboardUser did not complete before timeout".into(),
            });
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
