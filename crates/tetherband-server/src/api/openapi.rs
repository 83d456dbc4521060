//! OpenAPI specification generation for the tetherband API.

use axum::Json;
use tetherband_core::alerts::{Alert, AlertSound, ConditionKind};
use tetherband_core::{BeaconId, BeaconStatus, ConnectionState, RangeState, WornState};
use utoipa::OpenApi;

use super::alerts::AlertsResponse;
use super::beacons::{
    BeaconsResponse, DisconnectAllResponse, EmergencyRequest, LabelRequest, PairRequest,
    PairResponse,
};
use super::error::ErrorResponse;
use super::health::HealthResponse;

/// Serve the OpenAPI specification as JSON at `/api/openapi.json`.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Pretty-printed specification, for the gen-openapi binary.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for tetherband.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "tetherband API",
        version = "0.1.0",
        description = r#"
# tetherband API

tetherband keeps paired bracelets within range of this device.

## Overview

1. **Pairing**: start a scan for the bracelet carrying a pairing identifier
2. **Tracking**: each connected bracelet is sampled periodically and its
   distance classified as in range or out of range
3. **Alerts**: out-of-range, back-in-range, removed, put-on and connect
   failures are raised once per condition
4. **Control**: emergency pattern, power off and disconnect-all
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local tetherband server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "beacons", description = "Pairing, status and control of bracelets"),
        (name = "alerts", description = "Conditions currently shown to the user")
    ),
    paths(
        super::health::health_check,
        super::beacons::list_beacons,
        super::beacons::get_beacon,
        super::beacons::pair_beacon,
        super::beacons::set_label,
        super::beacons::start_tracking,
        super::beacons::stop_tracking,
        super::beacons::emergency,
        super::beacons::power_off,
        super::beacons::disconnect_all,
        super::alerts::list_alerts,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            BeaconId,
            BeaconStatus,
            ConnectionState,
            RangeState,
            WornState,
            BeaconsResponse,
            PairRequest,
            PairResponse,
            LabelRequest,
            EmergencyRequest,
            DisconnectAllResponse,
            Alert,
            AlertSound,
            ConditionKind,
            AlertsResponse,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "tetherband API");
        assert!(spec.paths.paths.contains_key("/api/beacons/pair"));
        assert!(spec.paths.paths.contains_key("/api/alerts"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"tetherband API\""));
    }
}
