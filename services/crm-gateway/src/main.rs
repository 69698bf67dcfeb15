//! CRM REST gateway
//!
//! Single-binary service that:
//! 1. Receives the CRM's install callback and stores the tenant's tokens
//! 2. Rebinds the app's UI placements
//! 3. Forwards `POST /rest/{method}` calls to the tenant's REST API,
//!    refreshing the access token once when it has expired

mod config;
mod error;
mod metrics;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Form, Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use crm_auth::{FileTokenStore, OAuthRefresher, TokenSet, TokenStore};
use crm_rpc::{Placement, RpcClient};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::error::Error;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    rpc: Arc<RpcClient>,
    placements: Arc<Vec<Placement>>,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/install", post(install_handler))
        .route("/rest/{method}", post(rest_handler))
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

    info!("starting crm-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

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
        token_endpoint = %config.oauth.token_endpoint,
        store_path = %config.store.path.display(),
        placements = config.placements.len(),
        "configuration loaded"
    );

    let client_secret = config
        .oauth
        .client_secret
        .clone()
        .context("client secret not configured")?;

    let http = reqwest::Client::new();
    let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(config.store.path.clone()));
    let refresher = Arc::new(OAuthRefresher::with_endpoint(
        http.clone(),
        config.oauth.token_endpoint.clone(),
        config.oauth.client_id.clone(),
        client_secret,
    ));
    let rpc = RpcClient::new(http, store, refresher).with_scheme(config.api.scheme.clone());

    let state = AppState {
        rpc: Arc::new(rpc),
        placements: Arc::new(config.placements),
        started_at: Instant::now(),
        prometheus: prometheus_handle,
    };

    let app = build_router(state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    info!(addr = %listen_addr, "accepting requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Tag the response with its request id and record route metrics.
fn finish(route: &'static str, request_id: &str, started: Instant, mut response: Response) -> Response {
    metrics::record_request(
        route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Health endpoint: reports whether a tenant is installed.
/// Returns 503 when the token store cannot be read.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();

    let (status_code, body) = match state.rpc.store().load().await {
        Ok(Some(tokens)) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "installed": true,
                "domain": tokens.domain,
                "uptime_seconds": uptime,
            }),
        ),
        Ok(None) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "not_installed",
                "installed": false,
                "uptime_seconds": uptime,
            }),
        ),
        Err(e) => {
            warn!(error = %e, "health check could not read token store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "degraded",
                    "installed": false,
                    "error": e.to_string(),
                    "uptime_seconds": uptime,
                }),
            )
        }
    };

    (status_code, axum::Json(body))
}

/// Prometheus metrics endpoint. Returns metrics in text exposition format.
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

/// Install callback form posted by the CRM. Other fields are ignored.
#[derive(Deserialize)]
struct InstallForm {
    #[serde(rename = "AUTH_ID", default)]
    auth_id: String,
    #[serde(rename = "REFRESH_ID", default)]
    refresh_id: String,
    #[serde(rename = "DOMAIN", default)]
    domain: String,
}

impl InstallForm {
    fn into_token_set(self) -> std::result::Result<TokenSet, Error> {
        if self.auth_id.is_empty() || self.refresh_id.is_empty() || self.domain.is_empty() {
            return Err(Error::BadRequest(
                "install requires AUTH_ID, REFRESH_ID and DOMAIN".into(),
            ));
        }
        Ok(TokenSet::new(self.auth_id, self.refresh_id, self.domain))
    }
}

/// POST /install: store the tenant's first token set and rebind placements.
async fn install_handler(State(state): State<AppState>, Form(form): Form<InstallForm>) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();

    let result = async {
        let tokens = form.into_token_set()?;
        let bound = crm_rpc::complete_install(
            state.rpc.store().as_ref(),
            &state.rpc,
            &tokens,
            &state.placements,
        )
        .await?;
        Ok::<_, Error>(bound)
    }
    .await;

    let response = match result {
        Ok(bound) => {
            info!(request_id = %request_id, placements = bound, "install completed");
            (
                StatusCode::OK,
                axum::Json(serde_json::json!({ "installed": true, "placements": bound })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "install failed");
            e.into_response()
        }
    };

    finish("install", &request_id, started, response)
}

/// POST /rest/{method}: forward a flat JSON object of params to the CRM.
async fn rest_handler(
    State(state): State<AppState>,
    Path(method): Path<String>,
    axum::Json(params): axum::Json<serde_json::Map<String, Value>>,
) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();

    let result = match flatten_params(params) {
        Ok(params) => state.rpc.call(&method, &params).await.map_err(Error::from),
        Err(e) => Err(e),
    };

    let response = match result {
        Ok(body) => (StatusCode::OK, axum::Json(body)).into_response(),
        Err(e) => {
            warn!(request_id = %request_id, method = %method, error = %e, "rest call failed");
            e.into_response()
        }
    };

    finish("rest", &request_id, started, response)
}

/// Convert scalar JSON params to the string map the REST API takes.
/// Nested keys must already be flattened (`fields[TITLE]`); nulls are dropped.
fn flatten_params(
    params: serde_json::Map<String, Value>,
) -> std::result::Result<BTreeMap<String, String>, Error> {
    let mut flat = BTreeMap::new();
    for (key, value) in params {
        let value = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(Error::BadRequest(format!(
                    "param {key} must be a string, number or boolean"
                )));
            }
        };
        flat.insert(key, value);
    }
    Ok(flat)
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
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
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
