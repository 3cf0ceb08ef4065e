use mimalloc::MiMalloc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use codeassist_gateway::credential::{CredentialManager, EventBus};
use codeassist_gateway::dispatch::{ClientCache, Dispatcher};
use codeassist_gateway::routing::RoutingStrategy;
use codeassist_gateway::server::{self, GatewayState};
use codeassist_gateway::storage;
use codeassist_gateway::usage::UsageTracker;
use codeassist_gateway::Config;

const ROUTING_STATE_CONFIG_KEY: &str = "routing_state";

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The server binary requires a real config file with a non-empty
    // `basic.api_key`. (Library code reads `CONFIG` instead, which is
    // best-effort and does not validate, so unit tests don't need one.)
    let cfg = Config::from_toml();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.basic.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_level(true).with_target(false))
        .init();

    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus metrics recorder");

    let shutdown = CancellationToken::new();

    let storage: Arc<dyn storage::Storage> =
        Arc::new(storage::instrumented::InstrumentedStorage::new(storage::auto::build(&cfg.storage).await));
    info!(backend = storage.name(), "storage backend ready");

    if !matches!(cfg.storage.backend, codeassist_gateway::config::StorageBackendKind::File) {
        let interval = Duration::from_secs(cfg.storage.mirror_interval_secs);
        let (_notify, _handle) =
            storage::mirror::spawn(storage.clone(), cfg.storage.auth_dir.clone(), interval, shutdown.clone());
    }

    spawn_plan_meta_retention(storage.clone(), cfg.storage.plan_history_retention_days, shutdown.clone());

    let events = Arc::new(EventBus::new());
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build oauth refresh http client");

    let manager = CredentialManager::new(
        cfg.credential_manager.clone(),
        storage.clone(),
        events.clone(),
        http,
        cfg.storage.auth_dir.clone(),
    );
    manager.load().await;
    if manager.is_empty() {
        warn!("credential manager loaded zero credentials; all requests will fail until one is added");
    }

    manager.start_periodic_refresh(shutdown.clone());
    manager.start_auto_recovery(shutdown.clone());
    manager.watch_auth_directory(shutdown.clone());

    let routing = Arc::new(RoutingStrategy::new(manager.clone(), cfg.credential_manager.clone()));
    if let Ok(Some(value)) = storage.get_config(ROUTING_STATE_CONFIG_KEY).await {
        match serde_json::from_value(value) {
            Ok(snapshot) => routing.restore(snapshot),
            Err(e) => warn!(error = %e, "failed to parse persisted routing_state, starting clean"),
        }
    }
    spawn_routing_state_persistence(routing.clone(), storage.clone(), shutdown.clone());

    let clients = ClientCache::new(&cfg.geminicli);
    clients.install_invalidation_hook(&events);

    let dispatcher = Dispatcher::new(manager.clone(), routing.clone(), clients.clone(), cfg.dispatch.clone(), cfg.geminicli.clone());

    let usage = UsageTracker::new(cfg.usage.clone(), storage.clone());
    usage.spawn(shutdown.clone());

    let state = GatewayState {
        manager,
        routing,
        dispatcher,
        usage,
        storage,
        api_key: Arc::from(cfg.basic.api_key.clone()),
        admin_cookie_name: Arc::from(cfg.basic.admin_cookie_name.clone()),
        prometheus,
    };

    let mut servers = Vec::new();

    if cfg.basic.openai_port != 0 {
        let addr = SocketAddr::from((cfg.basic.listen_addr, cfg.basic.openai_port));
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "OpenAI-compatible listener bound");
        servers.push(tokio::spawn(serve(listener, server::openai_router(state.clone()), shutdown.clone())));
    } else {
        info!("OpenAI-compatible listener disabled (basic.openai_port = 0)");
    }

    if cfg.basic.gemini_port != 0 {
        let addr = SocketAddr::from((cfg.basic.listen_addr, cfg.basic.gemini_port));
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "Gemini-native listener bound");
        servers.push(tokio::spawn(serve(listener, server::gemini_router(state.clone()), shutdown.clone())));
    } else {
        info!("Gemini-native listener disabled (basic.gemini_port = 0)");
    }

    shutdown_signal().await;
    info!("shutdown signal received, draining background tasks and listeners");
    shutdown.cancel();

    let grace = Duration::from_secs(cfg.basic.shutdown_timeout_secs);
    let _ = tokio::time::timeout(grace, futures::future::join_all(servers)).await;

    info!("server has shut down gracefully");
    Ok(())
}

async fn serve(listener: TcpListener, app: axum::Router, shutdown: CancellationToken) {
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown.cancelled_owned()).await {
        warn!(error = %e, "listener exited with error");
    }
}

/// Periodically persists the routing strategy's cooldown snapshot to the
/// `routing_state` config key, and once more on shutdown, so cooldowns
/// survive a restart (spec §4.3 "Snapshot/restore").
fn spawn_routing_state_persistence(
    routing: Arc<RoutingStrategy>,
    storage: Arc<dyn codeassist_gateway::storage::Storage>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    const PERSIST_INTERVAL: Duration = Duration::from_secs(30);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PERSIST_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    persist_routing_state(&routing, storage.as_ref()).await;
                    break;
                }
                _ = ticker.tick() => {
                    persist_routing_state(&routing, storage.as_ref()).await;
                }
            }
        }
    })
}

/// Periodically prunes `apply_config_batch` plan-meta history older than
/// `storage.plan_history_retention_days`. Backends that don't implement
/// `prune_plan_meta` (everything but Mongo) report `Unsupported`, which is
/// logged once at debug level and otherwise ignored.
fn spawn_plan_meta_retention(
    storage: Arc<dyn codeassist_gateway::storage::Storage>,
    retention_days: i64,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match storage.prune_plan_meta(retention_days).await {
                        Ok(deleted) if deleted > 0 => info!(deleted, "pruned stale plan-meta records"),
                        Ok(_) => {}
                        Err(e) => tracing::debug!(error = %e, "plan-meta retention sweep skipped"),
                    }
                }
            }
        }
    })
}

async fn persist_routing_state(routing: &RoutingStrategy, storage: &dyn codeassist_gateway::storage::Storage) {
    let snapshot = routing.snapshot();
    let value = match serde_json::to_value(&snapshot) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to serialize routing_state snapshot");
            return;
        }
    };
    if let Err(e) = storage.set_config(ROUTING_STATE_CONFIG_KEY, value).await {
        warn!(error = %e, "failed to persist routing_state");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
