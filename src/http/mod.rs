use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use const_format::formatcp;
use prometheus::{Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;

use crate::config_watcher::ActiveConfig;
use crate::consumer_groups::ConsumerGroupManager;

const BANNER: &str = formatcp!("{} v{}\n", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct HttpServiceState {
    manager: Arc<ConsumerGroupManager>,
    active_config: ActiveConfig,
    metrics: Arc<Registry>,
}

fn router(state: HttpServiceState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/metrics", get(prometheus_metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/groups", get(groups))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

pub async fn init(
    listen_on: SocketAddr,
    manager: Arc<ConsumerGroupManager>,
    active_config: ActiveConfig,
    shutdown_token: CancellationToken,
    metrics: Arc<Registry>,
) {
    let state = HttpServiceState {
        manager,
        active_config,
        metrics,
    };

    let listener = match TcpListener::bind(listen_on).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind '{listen_on}': {e}");
            shutdown_token.cancel();
            return;
        },
    };

    info!("Begin listening on '{}'...", listen_on);
    if let Err(e) =
        axum::serve(listener, router(state)).with_graceful_shutdown(shutdown_token.cancelled_owned()).await
    {
        error!("HTTP server failed: {e}");
    }
}

async fn root() -> &'static str {
    BANNER
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Ready once a valid broker configuration is active.
async fn readyz(State(state): State<HttpServiceState>) -> impl IntoResponse {
    match state.active_config.current() {
        Some(c) => (StatusCode::OK, format!("broker configuration v{}\n", c.version)),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no valid broker configuration\n".to_string()),
    }
}

async fn groups(State(state): State<HttpServiceState>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/yaml"));

    match serde_yaml::to_string(&state.manager.get_groups().await) {
        Ok(body) => (StatusCode::OK, headers, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, headers, format!("Failed to encode groups: {e}")),
    }
}

async fn prometheus_metrics(State(state): State<HttpServiceState>) -> impl IntoResponse {
    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();

    // As defined by Prometheus: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#basic-info
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));

    let mut body = String::new();
    let metrics_family = state.metrics.gather();
    if let Err(e) = TextEncoder.encode_utf8(&metrics_family, &mut body) {
        status = StatusCode::INTERNAL_SERVER_ERROR;
        body = format!("Failed to encode metrics: {e}");
    }

    (status, headers, body)
}
