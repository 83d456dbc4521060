//! Beacon status and control endpoints.
//!
//! Every handler is a thin call into the tracker; validation of labels and
//! beacon state happens in the engine.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tetherband_core::{BeaconId, BeaconStatus, PairingIdentifier, PairingRequest};
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::{ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the beacons router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_beacons))
        .route("/pair", post(pair_beacon))
        .route("/disconnect-all", post(disconnect_all))
        .route("/{id}", get(get_beacon))
        .route("/{id}/label", put(set_label))
        .route("/{id}/tracking/start", post(start_tracking))
        .route("/{id}/tracking/stop", post(stop_tracking))
        .route("/{id}/emergency", post(emergency))
        .route("/{id}/power-off", post(power_off))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// All beacons known to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BeaconsResponse {
    /// Status of each beacon, in id order.
    pub beacons: Vec<BeaconStatus>,
}

/// Request body for pairing a beacon.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "identifier": "B0201F39-97BC-A2F5-4621-C9AB58C9BFCA",
    "reconnect": false
}))]
pub struct PairRequest {
    /// Identifier read from the pairing tag: a 128-bit UUID or a 16/32-bit
    /// short form.
    #[schema(example = "B0201F39-97BC-A2F5-4621-C9AB58C9BFCA")]
    pub identifier: String,

    /// `true` to reconnect to a bracelet paired earlier.
    #[serde(default)]
    #[schema(example = false)]
    pub reconnect: bool,
}

/// Response after a pairing scan has started.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "identifier": "B0201F39-97BC-A2F5-4621-C9AB58C9BFCA",
    "scanning": true
}))]
pub struct PairResponse {
    /// Normalised pairing identifier.
    pub identifier: String,
    /// Whether a scan is now running.
    pub scanning: bool,
}

/// Request body for labelling a beacon.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "label": "Nick" }))]
pub struct LabelRequest {
    /// New label; `null` clears it.
    #[schema(example = "Nick", max_length = 64)]
    pub label: Option<String>,
}

/// Request body for the emergency pattern.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "active": true }))]
pub struct EmergencyRequest {
    /// Start (`true`) or stop (`false`) the pattern.
    pub active: bool,
}

/// Response after tearing down every session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "disconnected": 2 }))]
pub struct DisconnectAllResponse {
    /// Number of beacons removed.
    pub disconnected: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// List every beacon.
#[utoipa::path(
    get,
    path = "/api/beacons",
    tag = "beacons",
    operation_id = "listBeacons",
    summary = "List beacons",
    description = "Returns the status of every paired beacon: connection state, \
        latest distance, range and worn state, battery and counters.",
    responses(
        (status = 200, description = "Beacon statuses", body = BeaconsResponse),
        (status = 503, description = "Engine not running", body = ErrorResponse)
    )
)]
pub async fn list_beacons(State(state): State<SharedState>) -> ApiResult<Json<BeaconsResponse>> {
    let beacons = state.tracker.beacons().await?;
    Ok(Json(BeaconsResponse { beacons }))
}

/// Get one beacon.
#[utoipa::path(
    get,
    path = "/api/beacons/{id}",
    tag = "beacons",
    operation_id = "getBeacon",
    summary = "Get a beacon",
    params(("id" = usize, Path, description = "Beacon index")),
    responses(
        (status = 200, description = "Beacon status", body = BeaconStatus),
        (status = 404, description = "Unknown beacon", body = ErrorResponse)
    )
)]
pub async fn get_beacon(
    State(state): State<SharedState>,
    Path(id): Path<usize>,
) -> ApiResult<Json<BeaconStatus>> {
    Ok(Json(state.tracker.beacon(BeaconId(id)).await?))
}

/// Start pairing.
#[utoipa::path(
    post,
    path = "/api/beacons/pair",
    tag = "beacons",
    operation_id = "pairBeacon",
    summary = "Pair a beacon",
    description = "Starts scanning for the bracelet advertising the given pairing \
        identifier. The first matching bracelet sighted is connected. A pending \
        pairing is replaced.",
    request_body = PairRequest,
    responses(
        (status = 202, description = "Scan started", body = PairResponse),
        (status = 400, description = "Malformed identifier", body = ErrorResponse),
        (status = 503, description = "Bluetooth unavailable", body = ErrorResponse)
    )
)]
pub async fn pair_beacon(
    State(state): State<SharedState>,
    Json(request): Json<PairRequest>,
) -> ApiResult<(StatusCode, Json<PairResponse>)> {
    let identifier = PairingIdentifier::new(&request.identifier)?;
    let pairing = if request.reconnect {
        PairingRequest::reconnect(identifier.clone())
    } else {
        PairingRequest::fresh(identifier.clone())
    };
    info!(identifier = %identifier, reconnect = request.reconnect, "Pair requested");
    state.tracker.pair(pairing).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PairResponse {
            identifier: identifier.to_string(),
            scanning: true,
        }),
    ))
}

/// Set or clear a label.
#[utoipa::path(
    put,
    path = "/api/beacons/{id}/label",
    tag = "beacons",
    operation_id = "setBeaconLabel",
    summary = "Label a beacon",
    params(("id" = usize, Path, description = "Beacon index")),
    request_body = LabelRequest,
    responses(
        (status = 200, description = "Updated status", body = BeaconStatus),
        (status = 400, description = "Blank or overlong label", body = ErrorResponse),
        (status = 404, description = "Unknown beacon", body = ErrorResponse)
    )
)]
pub async fn set_label(
    State(state): State<SharedState>,
    Path(id): Path<usize>,
    Json(request): Json<LabelRequest>,
) -> ApiResult<Json<BeaconStatus>> {
    Ok(Json(state.tracker.set_label(BeaconId(id), request.label).await?))
}

/// Start sampling.
#[utoipa::path(
    post,
    path = "/api/beacons/{id}/tracking/start",
    tag = "beacons",
    operation_id = "startTracking",
    summary = "Start tracking a beacon",
    params(("id" = usize, Path, description = "Beacon index")),
    responses(
        (status = 204, description = "Tracking started"),
        (status = 404, description = "Unknown beacon", body = ErrorResponse)
    )
)]
pub async fn start_tracking(
    State(state): State<SharedState>,
    Path(id): Path<usize>,
) -> ApiResult<StatusCode> {
    state.tracker.start_tracking(BeaconId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stop sampling.
#[utoipa::path(
    post,
    path = "/api/beacons/{id}/tracking/stop",
    tag = "beacons",
    operation_id = "stopTracking",
    summary = "Stop tracking a beacon",
    params(("id" = usize, Path, description = "Beacon index")),
    responses(
        (status = 204, description = "Tracking stopped"),
        (status = 404, description = "Unknown beacon", body = ErrorResponse)
    )
)]
pub async fn stop_tracking(
    State(state): State<SharedState>,
    Path(id): Path<usize>,
) -> ApiResult<StatusCode> {
    state.tracker.stop_tracking(BeaconId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start or stop the emergency pattern.
#[utoipa::path(
    post,
    path = "/api/beacons/{id}/emergency",
    tag = "beacons",
    operation_id = "setEmergency",
    summary = "Start or stop the emergency pattern",
    params(("id" = usize, Path, description = "Beacon index")),
    request_body = EmergencyRequest,
    responses(
        (status = 204, description = "Command sent"),
        (status = 404, description = "Unknown beacon", body = ErrorResponse),
        (status = 409, description = "Beacon not connected", body = ErrorResponse)
    )
)]
pub async fn emergency(
    State(state): State<SharedState>,
    Path(id): Path<usize>,
    Json(request): Json<EmergencyRequest>,
) -> ApiResult<StatusCode> {
    state.tracker.emergency(BeaconId(id), request.active).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Power a bracelet off.
#[utoipa::path(
    post,
    path = "/api/beacons/{id}/power-off",
    tag = "beacons",
    operation_id = "powerOff",
    summary = "Power a bracelet off",
    params(("id" = usize, Path, description = "Beacon index")),
    responses(
        (status = 204, description = "Command sent"),
        (status = 404, description = "Unknown beacon", body = ErrorResponse),
        (status = 409, description = "Beacon not connected", body = ErrorResponse)
    )
)]
pub async fn power_off(
    State(state): State<SharedState>,
    Path(id): Path<usize>,
) -> ApiResult<StatusCode> {
    state.tracker.power_off(BeaconId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Tear down every session.
#[utoipa::path(
    post,
    path = "/api/beacons/disconnect-all",
    tag = "beacons",
    operation_id = "disconnectAll",
    summary = "Disconnect every beacon",
    description = "Stops every session, disconnects every bracelet and forgets them. \
        Outstanding alerts for those beacons are withdrawn.",
    responses(
        (status = 200, description = "Sessions torn down", body = DisconnectAllResponse)
    )
)]
pub async fn disconnect_all(
    State(state): State<SharedState>,
) -> ApiResult<Json<DisconnectAllResponse>> {
    let disconnected = state.tracker.disconnect_all().await?;
    Ok(Json(DisconnectAllResponse { disconnected }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_request_defaults_to_fresh() {
        let request: PairRequest = serde_json::from_str(r#"{"identifier": "180a"}"#).unwrap();
        assert!(!request.reconnect);
    }

    #[test]
    fn test_label_request_accepts_null() {
        let request: LabelRequest = serde_json::from_str(r#"{"label": null}"#).unwrap();
        assert_eq!(request.label, None);
    }
}
