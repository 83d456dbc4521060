//! Bluetooth LE central transport.
//!
//! The engine talks to radios only through [`Transport`]. Request/response
//! operations are async methods; unsolicited events (advertisements, link
//! loss, notifications) arrive on a [`TransportEvent`] channel created with
//! [`event_channel`] and handed to the transport at construction.
//!
//! Backends:
//! - [`mock::MockTransport`] - scriptable in-memory peripherals (feature `mock-bluetooth`)
//! - [`bluez::BluezTransport`] - BlueZ over D-Bus via `bluer` (feature `bluetooth`)

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::gatt::CharacteristicId;
use crate::pairing::PairingIdentifier;
use crate::types::{Advertisement, PeripheralHandle};

#[cfg(feature = "bluetooth")]
pub mod bluez;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;

/// Errors raised by transport operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No adapter is present.
    #[error("Bluetooth adapter not available")]
    AdapterUnavailable,

    /// The adapter is powered off.
    #[error("Bluetooth adapter is powered off")]
    AdapterPoweredOff,

    /// Discovery could not be started or stopped.
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    /// The handle does not name a known peripheral.
    #[error("Unknown peripheral {0}")]
    UnknownPeripheral(PeripheralHandle),

    /// The operation needs a connected peripheral.
    #[error("Peripheral {0} is not connected")]
    NotConnected(PeripheralHandle),

    /// Link establishment failed.
    #[error("Connecting to {handle} failed: {reason}")]
    ConnectFailed {
        /// Peripheral handle.
        handle: PeripheralHandle,
        /// Backend message.
        reason: String,
    },

    /// The service is not offered by the peripheral.
    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),

    /// The characteristic is not offered by its service.
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// A GATT read failed.
    #[error("Reading {characteristic} failed: {reason}")]
    ReadFailed {
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Backend message.
        reason: String,
    },

    /// A GATT write failed.
    #[error("Writing {characteristic} failed: {reason}")]
    WriteFailed {
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Backend message.
        reason: String,
    },

    /// Any other backend failure.
    #[error("Bluetooth backend error: {0}")]
    Backend(String),
}

/// Result alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Unsolicited event from the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peripheral was sighted while scanning.
    Advertisement(Advertisement),
    /// The link to a peripheral dropped.
    Disconnected {
        /// Peripheral handle.
        handle: PeripheralHandle,
        /// Backend-provided reason, if any.
        reason: Option<String>,
    },
    /// A subscribed characteristic changed.
    Notification {
        /// Peripheral handle.
        handle: PeripheralHandle,
        /// Characteristic that notified.
        characteristic: CharacteristicId,
        /// Raw value.
        payload: Vec<u8>,
    },
}

/// Sending half of the transport event channel.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
/// Receiving half of the transport event channel.
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create a transport event channel.
#[must_use]
pub fn event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

/// Bluetooth LE central operations used by the engine.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start scanning for peripherals offering the pairing service.
    async fn scan(&self, pairing: &PairingIdentifier) -> TransportResult<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> TransportResult<()>;

    /// Connect to a peripheral.
    async fn connect(&self, handle: &PeripheralHandle) -> TransportResult<()>;

    /// Disconnect from a peripheral. Disconnecting an idle peripheral succeeds.
    async fn disconnect(&self, handle: &PeripheralHandle) -> TransportResult<()>;

    /// Discover which of `services` the peripheral offers.
    async fn discover_services(
        &self,
        handle: &PeripheralHandle,
        services: &[Uuid],
    ) -> TransportResult<Vec<Uuid>>;

    /// List the characteristics of one service, in discovery order.
    async fn discover_characteristics(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
    ) -> TransportResult<Vec<Uuid>>;

    /// Read a characteristic value.
    async fn read_value(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
    ) -> TransportResult<Vec<u8>>;

    /// Write a one-byte command. `reliable` requests a write with response.
    async fn write_value(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
        value: u8,
        reliable: bool,
    ) -> TransportResult<()>;

    /// Enable notifications; values arrive as [`TransportEvent::Notification`].
    async fn subscribe_notifications(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
    ) -> TransportResult<()>;

    /// Read the current link RSSI in dBm.
    async fn read_signal_strength(&self, handle: &PeripheralHandle) -> TransportResult<i16>;

    /// Whether [`Transport::read_signal_strength`] only stays current while a
    /// scan runs. The tracker then keeps scanning while any beacon is tracked.
    fn signal_strength_needs_scan(&self) -> bool {
        false
    }
}
