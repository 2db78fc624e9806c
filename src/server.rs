//! Health and metrics HTTP surface
//!
//! `GET /healthz`, `/readyz` and `/livez` answer `ok`; `GET /metrics`
//! renders the process counters in Prometheus text format; everything
//! else is 404. Only served when a server address is configured.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Error;
use crate::metrics::ControllerMetrics;

/// Build the router for the health and metrics surface
pub fn router(metrics: Arc<ControllerMetrics>) -> Router {
    Router::new()
        .route("/healthz", get(ok))
        .route("/readyz", get(ok))
        .route("/livez", get(ok))
        .route("/metrics", get(render_metrics))
        .fallback(not_found)
        .with_state(metrics)
}

/// Bind the listen socket. Separated from [`serve`] so a bind failure
/// (address in use) is startup-fatal instead of a background log line.
///
/// # Errors
///
/// Returns a startup error when the address cannot be bound.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, Error> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::startup(format!("failed to bind {addr}: {e}")))
}

/// Serve the surface until cancellation.
///
/// # Errors
///
/// Returns a startup error if the server loop fails.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<ControllerMetrics>,
    token: CancellationToken,
) -> Result<(), Error> {
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "Serving health and metrics");
    }
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|e| Error::startup(format!("health server failed: {e}")))
}

async fn ok() -> &'static str {
    "ok"
}

async fn render_metrics(State(metrics): State<Arc<ControllerMetrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
