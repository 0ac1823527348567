//! Health and metrics endpoints.
//!
//! `/healthz` reports whether the node's collaborators (function gateway and
//! forecaster) are reachable; `/metrics` exposes the Prometheus registry.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tracing::info;

use crate::telemetry::{ForecasterClient, GatewayClient};

#[derive(Clone)]
struct AppState {
    gateway: GatewayClient,
    forecaster: ForecasterClient,
    prometheus: PrometheusHandle,
}

/// Serve `/healthz` and `/metrics` until shutdown.
pub async fn run(
    host: String,
    port: u16,
    gateway: GatewayClient,
    forecaster: ForecasterClient,
    prometheus: PrometheusHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let state = Arc::new(AppState {
        gateway,
        forecaster,
        prometheus,
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    info!(address = %listener.local_addr()?, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}

async fn healthz(State(state): State<Arc<AppState>>) -> (StatusCode, String) {
    let mut body = String::from("FaaS mesh node running.\nComponents status:\n");
    let mut healthy = true;

    match state.forecaster.healthz().await {
        Ok(()) => body.push_str("- forecaster ready.\n"),
        Err(_) => {
            healthy = false;
            body.push_str("- forecaster not ready.\n");
        }
    }

    match state.gateway.healthz().await {
        Ok(()) => body.push_str("- function gateway ready.\n"),
        Err(_) => {
            healthy = false;
            body.push_str("- function gateway not ready.\n");
        }
    }

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, body)
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.prometheus.render()
}
