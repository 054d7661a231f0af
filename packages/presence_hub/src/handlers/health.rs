use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::metrics;

/// Liveness probe - answers as long as the process serves HTTP, whatever
/// the state of the backplane.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();

    Json(metrics::HealthStatus {
        status: "UP".to_string(),
        hostname: state.identity.name.clone(),
        instance_id: state.identity.id.to_string(),
        connections: metrics.connections.active,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Readiness probe - 200 only when both backplane links are up and the
/// record store answers.
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    let links = state.bridge.status();
    let store_ok = state.records.ping().await.is_ok();
    let ready = links.is_ready() && store_ok;

    let body = Json(serde_json::json!({
        "status": if ready { "ready" } else { "not_ready" },
        "backplane": links,
        "store": if store_ok { "connected" } else { "disconnected" },
    }));

    if ready {
        body.into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}
