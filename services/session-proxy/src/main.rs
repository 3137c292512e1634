//! Session Proxy
//!
//! Single-binary Rust service that:
//! 1. Holds one signed-in backend session (access credential + refresh cookie)
//! 2. Listens for incoming requests
//! 3. Sends them through the authenticated pipeline, renewing on 401
//! 4. Answers 401 with a login redirect once the session cannot be renewed

mod config;
mod metrics;
mod proxy;
mod service;
mod session;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::proxy::ProxyState;
use crate::service::{DRAIN_TIMEOUT, ServiceMetrics};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
    /// Backend path probed by `/health`.
    liveness_path: Option<String>,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let session_routes = session::build_session_router(state.proxy.pipeline.clone());
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .with_state(state)
        .merge(session_routes)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
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

    info!("starting session-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

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
        listen_addr = %config.proxy.listen_addr,
        base_url = %config.backend.base_url,
        coalesce_renewals = config.session.coalesce_renewals,
        persistent = config.session.state_file.is_some(),
        "configuration loaded"
    );

    let pipeline = service::build_pipeline(&config, reqwest::Client::new())
        .await
        .context("failed to initialize session state")?;

    let metrics = ServiceMetrics::new();
    let app_state = AppState {
        proxy: ProxyState {
            pipeline,
            requests_total: metrics.requests_total.clone(),
            errors_total: metrics.errors_total.clone(),
            in_flight: metrics.in_flight.clone(),
        },
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
        liveness_path: config.backend.liveness_path.clone(),
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    let in_flight = metrics.in_flight.clone();

    // The drain timer starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: JSON with status, backend liveness, uptime, counters.
/// Returns 503 when the configured liveness probe fails.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let authenticated = state.proxy.pipeline.store().get().await.is_some();

    let backend = match &state.liveness_path {
        Some(path) => {
            if state.proxy.pipeline.liveness(path).await {
                "up"
            } else {
                "down"
            }
        }
        None => "unchecked",
    };

    let (status_code, status) = if backend == "down" {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (axum::http::StatusCode::OK, "healthy")
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "status": status,
            "backend": backend,
            "authenticated": authenticated,
            "uptime_seconds": uptime,
            "requests_served": requests,
            "errors_total": errors,
        })
        .to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies everything else to the backend.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
