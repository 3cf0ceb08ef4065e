//! Per-credential HTTP client cache. Each `credential.id` gets a lazily
//! created `reqwest::Client` bound to that credential's current access
//! token via a default `Authorization` header. Entries are invalidated on
//! `credential_changed` events (refresh, ban) so a stale bearer token is
//! never reused — spec §4.4 "Per-credential client cache".

use crate::config::GeminiCliConfig;
use crate::credential::{Credential, EventBus};
use crate::error::GatewayError;
use dashmap::DashMap;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use std::sync::Arc;
use std::time::Duration;

const CODE_ASSIST_USER_AGENT: &str = "google-api-nodejs-client/9.15.1";

pub struct ClientCache {
    clients: DashMap<String, Arc<reqwest::Client>>,
    proxy: Option<url::Url>,
    enable_multiplexing: bool,
}

impl ClientCache {
    pub fn new(cfg: &GeminiCliConfig) -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            proxy: cfg.proxy.clone(),
            enable_multiplexing: cfg.enable_multiplexing,
        })
    }

    /// Wires this cache's `invalidate` into the credential manager's event
    /// bus, so a refresh or ban drops the cached client without the cache
    /// holding a reference back into the manager (spec §9, cyclic shape).
    pub fn install_invalidation_hook(self: &Arc<Self>, events: &EventBus) {
        let this = self.clone();
        events.register_invalidation_hook(move |credential_id| this.invalidate(credential_id));
    }

    pub fn invalidate(&self, credential_id: &str) {
        self.clients.remove(credential_id);
    }

    /// Returns the cached client for `cred`, building one if absent.
    /// `DashMap::entry` gives double-checked-locking semantics: concurrent
    /// callers for the same id never build more than one client, matching
    /// the "created at most once" requirement in spec §5.
    pub fn get_or_create(&self, cred: &Credential) -> Result<Arc<reqwest::Client>, GatewayError> {
        if let Some(existing) = self.clients.get(&cred.id) {
            return Ok(existing.clone());
        }
        let client = Arc::new(self.build_client(cred)?);
        Ok(self
            .clients
            .entry(cred.id.clone())
            .or_insert(client)
            .clone())
    }

    fn build_client(&self, cred: &Credential) -> Result<reqwest::Client, GatewayError> {
        let token = cred.access_token().ok_or(GatewayError::MissingAccessToken)?;

        let mut headers = HeaderMap::new();
        let mut auth_value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| GatewayError::UnexpectedError(e.to_string()))?;
        auth_value.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(USER_AGENT, HeaderValue::from_static(CODE_ASSIST_USER_AGENT));

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10));

        if !self.enable_multiplexing {
            builder = builder.http1_only();
        } else {
            builder = builder.http2_adaptive_window(true);
        }

        if let Some(proxy) = &self.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str()).map_err(GatewayError::ReqwestError)?;
            builder = builder.proxy(proxy);
        }

        builder.build().map_err(GatewayError::ReqwestError)
    }
}
