//! # tetherband-core
//!
//! Proximity-tracking engine for tetherband bracelets.
//!
//! This crate provides:
//! - RSSI sampling and distance estimation for connected beacons
//! - Debounced in-range / out-of-range classification
//! - Worn-state tracking from the bracelet's capacitive sensor
//! - Deduplicated user alerts and a timestamped event log
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`filter`] - RSSI mode selection and log-distance path-loss model
//! - [`range`] - Out-of-range debounce state machine
//! - [`worn`] - Capacitive-sense worn state machine
//! - [`sampling`] - One bounded RSSI batch per call
//! - [`session`] - Per-beacon actor owning the connection lifecycle
//! - [`registry`] - Stable beacon identities and status snapshots
//! - [`alerts`] - Alert dedup, dispatch and sinks
//! - [`tracker`] - The actor tying transport, sessions and alerts together
//! - [`transport`] - Bluetooth LE central abstraction and backends
//! - [`gatt`] - GATT profile of the bracelet
//! - [`pairing`] - Pairing identifiers and requests
//! - [`eventlog`] - Append-only event log sinks
//! - [`config`] - Configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod alerts;
pub mod config;
pub mod error;
pub mod eventlog;
pub mod filter;
pub mod gatt;
pub mod pairing;
pub mod range;
pub mod registry;
pub mod sampling;
pub mod session;
pub mod tracker;
pub mod transport;
pub mod types;
pub mod worn;

// Re-export primary types for convenience
pub use alerts::{
    Alert, AlertDispatcher, AlertSink, AlertSound, ConditionFamily, ConditionKind,
    MemoryAlertSink, NotificationDedup,
};
pub use config::{
    is_valid_timezone, CommandBytes, Config, ConfigError, ConfigResult, LoggingConfig,
    SensorCodes, ServerConfig, TrackingConfig,
};
pub use error::{Result, TetherbandError};
pub use eventlog::{EventLog, EventLogger, FileEventLog, TracingEventLog};
pub use filter::{format_distance, ProximityFilter};
pub use pairing::{PairingError, PairingIdentifier, PairingRequest};
pub use range::{RangeEvent, RangeStateMachine};
pub use registry::ConnectionRegistry;
pub use tracker::{Tracker, TrackerHandle};
#[cfg(feature = "bluetooth")]
pub use transport::bluez::BluezTransport;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub use transport::mock::{MockPeripheral, MockTransport};
pub use transport::{event_channel, Transport, TransportError, TransportEvent};
pub use types::{
    BeaconId, BeaconStatus, ConnectionState, PeripheralHandle, RangeState, WornState,
};
pub use worn::{WornEvent, WornStateMachine};
