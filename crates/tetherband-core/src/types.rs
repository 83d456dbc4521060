//! Shared types and OpenAPI schemas.
//!
//! This module contains the identity, state and status types that cross
//! module boundaries: the registry hands them to the server, sessions report
//! them back to the registry.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::pairing::PairingIdentifier;

/// Stable logical index of one physical beacon.
///
/// Allocated once by the registry and never reused, so it survives
/// reconnects even though the transport handle does not.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct BeaconId(pub usize);

impl fmt::Display for BeaconId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport-level handle of a peripheral.
///
/// Opaque to the engine. For BlueZ this is the device address; the handle
/// may change every time the beacon is re-discovered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct PeripheralHandle(pub String);

impl PeripheralHandle {
    /// Wrap a transport handle.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection lifecycle of one beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Seen in an advertisement, no connect attempt yet.
    Discovered,
    /// Link establishment in progress.
    Connecting,
    /// Waiting for the service list.
    DiscoveringServices,
    /// Resolving characteristic handles.
    DiscoveringCharacteristics,
    /// Fully connected; sampling may run.
    Ready,
    /// Link lost; waiting to re-sight the beacon.
    Reconnecting,
}

impl ConnectionState {
    /// Whether the link is considered up.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Range classification produced by the range state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RangeState {
    /// Within the configured maximum distance.
    #[default]
    InRange,
    /// Confirmed beyond the maximum distance.
    OutOfRange,
}

/// Whether the bracelet is on the wearer's wrist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WornState {
    /// Capacitive sensor reports skin contact.
    On,
    /// No skin contact.
    #[default]
    Off,
}

/// Manufacturer-specific advertisement payload, parsed once at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ManufacturerData {
    /// Bluetooth SIG company identifier.
    pub company_id: u16,
    /// Raw payload following the company identifier.
    pub payload: Vec<u8>,
}

/// One advertisement sighting delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Handle to connect with.
    pub handle: PeripheralHandle,
    /// Advertised local name, if broadcast.
    pub local_name: Option<String>,
    /// Advertisement RSSI in dBm.
    pub rssi: Option<i16>,
    /// Typed manufacturer data, if present.
    pub manufacturer_data: Option<ManufacturerData>,
}

/// Name used for peripherals that do not advertise one.
pub const UNKNOWN_NAME: &str = "Unknown";

impl Advertisement {
    /// Advertised name, falling back to [`UNKNOWN_NAME`].
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.local_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(UNKNOWN_NAME)
    }
}

/// Stable identity of one physical beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconIdentity {
    /// Stable index.
    pub id: BeaconId,
    /// Advertised name; the identity key.
    pub name: String,
    /// Identifier scanned from the pairing tag.
    pub pairing: PairingIdentifier,
    /// Human label assigned by the user.
    pub label: Option<String>,
    /// Current transport handle; `None` while disconnected.
    pub handle: Option<PeripheralHandle>,
}

impl BeaconIdentity {
    /// The user label if set, otherwise the advertised name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

/// Point-in-time status of one beacon, as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": 0,
    "name": "Tetherband-01",
    "label": "Nick",
    "pairing_identifier": "B0201F39-97BC-A2F5-4621-C9AB58C9BFCA",
    "connection": "ready",
    "range": "in_range",
    "worn": "on",
    "distance_mm": 79.43,
    "distance_text": "7.94 cm",
    "tx_power": -12,
    "battery_level": 87,
    "battery_reported": true,
    "tracking": true,
    "tracking_started": true,
    "batches_completed": 12,
    "reconnects": 0,
    "updated_at_utc": "2025-01-15T03:30:00Z"
}))]
pub struct BeaconStatus {
    /// Stable beacon index.
    pub id: BeaconId,
    /// Advertised name.
    pub name: String,
    /// User-assigned label.
    pub label: Option<String>,
    /// Pairing identifier the beacon was paired with.
    pub pairing_identifier: String,
    /// Connection lifecycle state.
    pub connection: ConnectionState,
    /// Latest range classification.
    pub range: RangeState,
    /// Latest worn state.
    pub worn: WornState,
    /// Last estimated distance in millimetres.
    pub distance_mm: Option<f64>,
    /// Last estimated distance, human readable.
    pub distance_text: Option<String>,
    /// Cached transmit power in dBm.
    pub tx_power: Option<i8>,
    /// Battery percentage.
    pub battery_level: Option<u8>,
    /// Whether the beacon has reported its battery level at least once.
    pub battery_reported: bool,
    /// Whether sampling is requested for this beacon.
    pub tracking: bool,
    /// Whether at least one sample batch has completed.
    pub tracking_started: bool,
    /// Number of completed sample batches.
    pub batches_completed: u64,
    /// Number of times the link was lost and re-established.
    pub reconnects: u32,
    /// When this status last changed.
    pub updated_at_utc: DateTime<Utc>,
}

impl BeaconStatus {
    /// Initial status for a freshly registered identity.
    #[must_use]
    pub fn new(identity: &BeaconIdentity) -> Self {
        Self {
            id: identity.id,
            name: identity.name.clone(),
            label: identity.label.clone(),
            pairing_identifier: identity.pairing.to_string(),
            connection: ConnectionState::Discovered,
            range: RangeState::InRange,
            worn: WornState::Off,
            distance_mm: None,
            distance_text: None,
            tx_power: None,
            battery_level: None,
            battery_reported: false,
            tracking: false,
            tracking_started: false,
            batches_completed: 0,
            reconnects: 0,
            updated_at_utc: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertisement(name: Option<&str>) -> Advertisement {
        Advertisement {
            handle: PeripheralHandle::new("AA:BB:CC:DD:EE:FF"),
            local_name: name.map(str::to_string),
            rssi: Some(-60),
            manufacturer_data: None,
        }
    }

    #[test]
    fn test_display_name_falls_back_to_unknown() {
        assert_eq!(advertisement(None).display_name(), UNKNOWN_NAME);
        assert_eq!(advertisement(Some("  ")).display_name(), UNKNOWN_NAME);
        assert_eq!(advertisement(Some("Band-7")).display_name(), "Band-7");
    }

    #[test]
    fn test_identity_display_prefers_label() {
        let mut identity = BeaconIdentity {
            id: BeaconId(0),
            name: "Band-7".to_string(),
            pairing: PairingIdentifier::new("180A").unwrap(),
            label: None,
            handle: None,
        };
        assert_eq!(identity.display_name(), "Band-7");
        identity.label = Some("Carlie".to_string());
        assert_eq!(identity.display_name(), "Carlie");
    }

    #[test]
    fn test_status_serializes_snake_case_states() {
        let identity = BeaconIdentity {
            id: BeaconId(3),
            name: "Band-7".to_string(),
            pairing: PairingIdentifier::new("180A").unwrap(),
            label: None,
            handle: None,
        };
        let status = BeaconStatus::new(&identity);
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"connection\":\"discovered\""));
        assert!(json.contains("\"range\":\"in_range\""));
        assert!(json.contains("\"id\":3"));
    }
}
