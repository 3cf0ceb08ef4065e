//! Shared application state handed to every axum handler on both listeners.

use crate::credential::CredentialManager;
use crate::dispatch::Dispatcher;
use crate::routing::RoutingStrategy;
use crate::storage::Storage;
use crate::usage::UsageTracker;
use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, LazyLock};

static COOKIE_KEY: LazyLock<Key> = LazyLock::new(Key::generate);

#[derive(Clone)]
pub struct GatewayState {
    pub manager: Arc<CredentialManager>,
    pub routing: Arc<RoutingStrategy>,
    pub dispatcher: Arc<Dispatcher>,
    pub usage: Arc<UsageTracker>,
    pub storage: Arc<dyn Storage>,
    pub api_key: Arc<str>,
    pub admin_cookie_name: Arc<str>,
    pub prometheus: PrometheusHandle,
}

impl FromRef<GatewayState> for Key {
    fn from_ref(_state: &GatewayState) -> Self {
        COOKIE_KEY.clone()
    }
}
