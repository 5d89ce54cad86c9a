//! Probe Server
//!
//! Liveness, readiness and Prometheus metrics over HTTP.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::metrics::OperatorMetrics;
use crate::error::{Error, Result};

/// Shared handler state
#[derive(Clone)]
pub struct ProbeState {
    pub ready: Arc<AtomicBool>,
    pub metrics: OperatorMetrics,
}

/// Build the probe router
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until `token` is cancelled
pub async fn serve(addr: SocketAddr, state: ProbeState, token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind probe server on {}: {}", addr, e)))?;
    serve_on(listener, state, token).await
}

/// Serve on an already bound listener
pub async fn serve_on(listener: TcpListener, state: ProbeState, token: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Probe server listening on {}", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            token.cancelled().await;
            info!("Probe server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("Probe server error: {}", e)))
}

// =============================================================================
// Handlers
// =============================================================================

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<ProbeState>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "controller not started")
    }
}

async fn metrics(State(state): State<ProbeState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                e.to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start(state: ProbeState) -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let token = CancellationToken::new();
        tokio::spawn(serve_on(listener, state, token.clone()));
        (base, token)
    }

    #[tokio::test]
    async fn test_probe_endpoints() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.update_device_metrics("node-a", &[crate::crd::GPUDeviceState::Ready]);
        let ready = Arc::new(AtomicBool::new(false));
        let (base, token) = start(ProbeState {
            ready: ready.clone(),
            metrics,
        })
        .await;
        let client = reqwest::Client::new();

        let health = client.get(format!("{base}/healthz")).send().await.unwrap();
        assert_eq!(health.status(), reqwest::StatusCode::OK);

        let not_ready = client.get(format!("{base}/readyz")).send().await.unwrap();
        assert_eq!(not_ready.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        ready.store(true, Ordering::SeqCst);
        let now_ready = client.get(format!("{base}/readyz")).send().await.unwrap();
        assert_eq!(now_ready.status(), reqwest::StatusCode::OK);

        let body = client
            .get(format!("{base}/metrics"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("gpu_fleet_node_devices{node=\"node-a\"} 1"));

        token.cancel();
    }
}
