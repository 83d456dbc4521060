//! Active alert listing.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tetherband_core::Alert;
use utoipa::ToSchema;

use crate::state::SharedState;

/// Creates the alerts router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(list_alerts))
}

/// Alerts currently shown.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AlertsResponse {
    /// One alert per beacon and condition family, ordered by target.
    pub alerts: Vec<Alert>,
    /// Alerts presented since the server started.
    #[schema(example = 4)]
    pub presented_total: u64,
}

/// List active alerts.
#[utoipa::path(
    get,
    path = "/api/alerts",
    tag = "alerts",
    operation_id = "listAlerts",
    summary = "List active alerts",
    description = "Returns the alerts currently shown to the user. A condition \
        stays listed until its complement replaces it (for example back-in-range \
        replaces out-of-range) or its beacon is disconnected.",
    responses(
        (status = 200, description = "Active alerts", body = AlertsResponse)
    )
)]
pub async fn list_alerts(State(state): State<SharedState>) -> Json<AlertsResponse> {
    Json(AlertsResponse {
        alerts: state.alerts.active(),
        presented_total: state.alerts.presented_count(),
    })
}
