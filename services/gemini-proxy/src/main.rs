//! Gemini key-pool proxy
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of Gemini API keys
//! 2. Listens for native and OpenAI-compatible requests
//! 3. Forwards each one with a key chosen by the dispatcher
//! 4. Cools a key down when the upstream rate-limits it

mod config;
mod error;
mod metrics;
mod routes;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use key_pool::{CredentialStore, Dispatcher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::Forwarder;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::error::ApiError;
use crate::routes::ProxyState;

/// Mount point of the OpenAI-compatible surface.
const OPENAI_PREFIX: &str = "/v1";

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// The native route embeds the configured API version, e.g.
/// `/v1beta/models/{target}`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let native_route = format!(
        "/{}/models/{{target}}",
        state.proxy.forwarder.config().api_version
    );
    let openai_route = format!("{OPENAI_PREFIX}/{{*path}}");
    Router::new()
        .route(
            "/health",
            get(health_handler).fallback(|r: Request<Body>| method_not_allowed(r, "GET")),
        )
        .route(
            "/metrics",
            get(metrics_handler).fallback(|r: Request<Body>| method_not_allowed(r, "GET")),
        )
        .route(
            &native_route,
            post(native_handler).fallback(|r: Request<Body>| method_not_allowed(r, "POST")),
        )
        .route(&openai_route, any(openai_handler))
        .fallback(fallback_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
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

    info!("starting gemini-key-proxy");

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
        upstream_url = %config.proxy.upstream_url,
        keys = config.keys.len(),
        strategy = %config.pool.strategy,
        cooldown_ms = config.pool.cooldown_ms,
        max_attempts = config.proxy.max_attempts,
        headers = config.headers.len(),
        "configuration loaded"
    );

    let cooldown = config.cooldown();
    let forwarder = Forwarder::new(reqwest::Client::new(), config.forwarder_config())
        .context("invalid upstream settings")?;
    let store = Arc::new(CredentialStore::with_weights(
        config.keys,
        &config.pool.weights,
    ));
    let dispatcher = Dispatcher::new(store, config.pool.strategy);

    let app_state = AppState {
        proxy: ProxyState {
            dispatcher: Arc::new(dispatcher),
            forwarder,
            cooldown,
            max_attempts: config.proxy.max_attempts,
        },
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt: notify the server to stop
    // accepting, then race the drain against DRAIN_TIMEOUT.
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
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Record request metrics and tag the response with its request id.
fn finish(mut response: Response, method: &str, started: Instant, request_id: &str) -> Response {
    metrics::record_request(
        response.status().as_u16(),
        method,
        started.elapsed().as_secs_f64(),
    );
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Health endpoint: pool health summary plus uptime.
/// Returns 200 while at least one credential is eligible, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher = &state.proxy.dispatcher;
    let mut body = dispatcher.store().health(tokio::time::Instant::now());
    body["strategy"] = serde_json::json!(dispatcher.strategy_name());
    body["uptime_seconds"] = serde_json::json!(state.started_at.elapsed().as_secs());

    let status_code = if body["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn native_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    let target = routes::native_target(request.uri()).to_string();
    let response = routes::native(&state.proxy, &target, request, &request_id).await;
    finish(response, "POST", started, &request_id)
}

async fn openai_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    let method = request.method().to_string();
    let path = routes::passthrough_path(request.uri(), OPENAI_PREFIX).to_string();
    let response = routes::openai(&state.proxy, &path, request, &request_id).await;
    finish(response, &method, started, &request_id)
}

async fn fallback_handler(request: Request<Body>) -> Response {
    let message = format!("no route for {} {}", request.method(), request.uri().path());
    reject(&request, StatusCode::NOT_FOUND, message)
}

/// Wrong method on a known route.
async fn method_not_allowed(request: Request<Body>, allow: &'static str) -> Response {
    let message = format!(
        "method {} not allowed on {}, expected {allow}",
        request.method(),
        request.uri().path()
    );
    let mut response = reject(&request, StatusCode::METHOD_NOT_ALLOWED, message);
    response
        .headers_mut()
        .insert(axum::http::header::ALLOW, HeaderValue::from_static(allow));
    response
}

fn reject(request: &Request<Body>, status: StatusCode, message: String) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    let method = request.method().to_string();
    let response = ApiError::new(status, error::ErrorType::InvalidRequest, message)
        .into_response(&request_id);
    finish(response, &method, started, &request_id)
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
            Ok(mut signal) => {
                signal.recv().await;
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
