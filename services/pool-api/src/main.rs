//! Upstream Account Pool API
//!
//! Single-binary Rust service that:
//! 1. Loads the account registry and circuit audit log
//! 2. Restores last-known circuit states from the audit log
//! 3. Serves the work-traffic API (select/outcome) plus health and metrics
//! 4. Serves the admin API (account management) on a separate port

mod admin;
mod api;
mod config;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use account_pool::breaker::{CircuitBreaker, CircuitState, MemoryCircuitStore};
use account_pool::capacity::MemoryCapacityStore;
use account_pool::{AccountPool, spawn_audit_task};
use account_store::{AccountStore, TransitionLog};

use crate::admin::AdminState;
use crate::api::ApiState;
use crate::config::Config;

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the health and metrics handlers
#[derive(Clone)]
struct AppState {
    pool: Arc<AccountPool>,
    prometheus: PrometheusHandle,
}

/// Build the work-traffic router: select/outcome plus health and metrics,
/// under a concurrency limit.
fn build_router(state: AppState, api: Router, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(api)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

/// GET /health — pool health summary (no credentials).
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.pool.health().await;
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        health.to_string(),
    )
}

/// GET /metrics — Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus.render()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting upstream-pool-api");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        accounts_file = %config.pool.accounts_file.display(),
        window_secs = config.pool.window_secs,
        admin_auth = config.server.admin_token.is_some(),
        "configuration loaded"
    );

    // Durable state: account registry + circuit transition audit log
    let registry = Arc::new(
        AccountStore::load(config.pool.accounts_file.clone())
            .await
            .context("failed to load account registry")?,
    );
    let audit_log = Arc::new(
        TransitionLog::open(config.pool.audit_file.clone())
            .await
            .context("failed to open transition audit log")?,
    );

    // Live state: circuit breaker + capacity windows
    let breaker = Arc::new(CircuitBreaker::new(
        Arc::new(MemoryCircuitStore::new()),
        config.breaker.to_breaker_config(),
    ));

    // The audit log is the durable fallback for circuit state: seed the fast
    // store with the last known state per account.
    let last_states = audit_log
        .last_states()
        .await
        .context("failed to replay transition audit log")?;
    for (account_id, label) in last_states {
        match CircuitState::parse(&label) {
            Some(state) if state != CircuitState::Closed => {
                if let Err(e) = breaker.restore(&account_id, state).await {
                    warn!(account_id, error = %e, "could not restore circuit state");
                }
            }
            Some(_) => {}
            None => warn!(account_id, label, "unknown circuit state label in audit log"),
        }
    }

    let capacity = Arc::new(MemoryCapacityStore::new(Duration::from_secs(
        config.pool.window_secs,
    )));

    let pool = Arc::new(AccountPool::new(
        registry,
        capacity,
        breaker.clone(),
        Duration::from_secs(config.pool.window_secs),
    ));

    // Persist circuit transitions for audit/alerting in the background
    let audit_handle = spawn_audit_task(breaker.subscribe(), audit_log);

    // Work-traffic listener
    let app_state = AppState {
        pool: pool.clone(),
        prometheus,
    };
    let api_router = api::build_api_router(ApiState { pool: pool.clone() });
    let app = build_router(app_state, api_router, config.server.max_connections);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;

    // Admin listener on its own port
    let admin_router = admin::build_admin_router(AdminState::new(
        pool.clone(),
        config.server.admin_token,
    ));
    let admin_listener = TcpListener::bind(config.server.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin to {}", config.server.admin_addr))?;

    info!(
        addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        "accepting requests"
    );

    // Graceful shutdown: on SIGTERM/SIGINT both listeners stop accepting and
    // drain in-flight requests, bounded by DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let (admin_shutdown_tx, admin_shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });
    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin_router)
            .with_graceful_shutdown(async {
                let _ = admin_shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining");

    let _ = shutdown_tx.send(());
    let _ = admin_shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, async {
        let (server, admin) = tokio::join!(server_handle, admin_handle);
        (server, admin)
    })
    .await
    {
        Ok((server, admin)) => {
            for result in [server, admin] {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "server error during shutdown"),
                    Err(e) => error!(error = %e, "server task panicked"),
                }
            }
            info!("all in-flight requests drained");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    audit_handle.abort();
    info!("stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
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
