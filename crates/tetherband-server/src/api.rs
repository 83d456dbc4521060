//! HTTP API routes and handlers.
//!
//! - `beacons` - Pairing, status and control of bracelets
//! - `alerts` - Active alerts
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod alerts;
pub mod beacons;
pub mod error;
pub mod health;
pub mod openapi;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                         - Health check
/// /api
/// ├── /beacons                    - List beacons
/// │   ├── /pair                   - Start pairing
/// │   ├── /disconnect-all         - Tear down every session
/// │   └── /{id}
/// │       ├── /label              - Set or clear the label
/// │       ├── /tracking/start     - Start sampling
/// │       ├── /tracking/stop      - Stop sampling
/// │       ├── /emergency          - Emergency pattern on/off
/// │       └── /power-off          - Power the bracelet off
/// ├── /alerts                     - Active alerts
/// └── /openapi.json               - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/beacons", beacons::router())
                .nest("/alerts", alerts::router()),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tetherband_core::transport::mock::{MockPeripheral, MockTransport};
    use tetherband_core::{
        event_channel, Config, EventLogger, MemoryAlertSink, PairingIdentifier, Tracker,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::state::AppState;

    fn app() -> (Router, Arc<MockTransport>) {
        let (tx, rx) = event_channel();
        let transport = Arc::new(MockTransport::new(tx));
        let pairing = PairingIdentifier::new("180A").unwrap();
        transport.add_peripheral("AA", MockPeripheral::bracelet("Band-1", &pairing, -12, -50));

        let config = Arc::new(Config::default());
        let alerts = Arc::new(MemoryAlertSink::new());
        let (tracker, _task) = Tracker::spawn(
            config.clone(),
            transport.clone(),
            rx,
            alerts.clone(),
            EventLogger::tracing_only(),
        );
        (
            create_router(AppState::shared(config, tracker, alerts)),
            transport,
        )
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["beacons"], 0);
    }

    #[tokio::test]
    async fn test_unknown_beacon_is_404() {
        let (app, _) = app();
        let (status, body) = send(&app, "GET", "/api/beacons/7", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "BEACON_NOT_FOUND");

        let (status, _) = send(&app, "POST", "/api/beacons/7/power-off", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pair_rejects_malformed_identifier() {
        let (app, _) = app();
        let (status, body) = send(
            &app,
            "POST",
            "/api/beacons/pair",
            Some(r#"{"identifier": "not-a-uuid"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "INVALID_PAIRING_IDENTIFIER");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_label_and_disconnect_flow() {
        let (app, transport) = app();
        let (status, body) = send(
            &app,
            "POST",
            "/api/beacons/pair",
            Some(r#"{"identifier": "180a"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["identifier"], "180A");

        let mut ready = false;
        for _ in 0..200 {
            let (_, body) = send(&app, "GET", "/api/beacons", None).await;
            if body["beacons"][0]["connection"] == "ready" {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ready);

        let (status, body) = send(
            &app,
            "PUT",
            "/api/beacons/0/label",
            Some(r#"{"label": "  Nick  "}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["label"], "Nick");

        let (status, body) =
            send(&app, "PUT", "/api/beacons/0/label", Some(r#"{"label": " "}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "INVALID_LABEL");

        let (status, _) = send(
            &app,
            "POST",
            "/api/beacons/0/emergency",
            Some(r#"{"active": true}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, "POST", "/api/beacons/disconnect-all", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["disconnected"], 1);
        assert!(!transport.is_connected("AA"));

        let (_, body) = send(&app, "GET", "/api/alerts", None).await;
        assert_eq!(body["alerts"].as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn test_openapi_served() {
        let (app, _) = app();
        let (status, body) = send(&app, "GET", "/api/openapi.json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["info"]["title"], "tetherband API");
    }
}
