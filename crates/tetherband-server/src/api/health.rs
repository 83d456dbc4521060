//! Health check API endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "ok",
    "version": "0.1.0",
    "engine_running": true,
    "beacons": 2,
    "uptime_secs": 3600
}))]
pub struct HealthResponse {
    /// `ok` when the engine answers, `degraded` otherwise.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version from Cargo.toml.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Whether the tracking engine responded.
    #[schema(example = true)]
    pub engine_running: bool,

    /// Number of registered beacons.
    #[schema(example = 2)]
    pub beacons: usize,

    /// Seconds since the server started.
    #[schema(example = 3600)]
    pub uptime_secs: i64,
}

/// Creates the health router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(health_check))
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    operation_id = "healthCheck",
    summary = "Check service health",
    description = "Returns service status, whether the tracking engine is running, \
        and how many beacons are registered.",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let beacons = state.tracker.beacons().await;
    let engine_running = beacons.is_ok();

    Json(HealthResponse {
        status: if engine_running { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        engine_running,
        beacons: beacons.map_or(0, |b| b.len()),
        uptime_secs: (Utc::now() - state.started_at_utc).num_seconds(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            engine_running: true,
            beacons: 0,
            uptime_secs: 5,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"engine_running\":true"));
    }
}
