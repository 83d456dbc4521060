//! Unified error types for the tetherband core library.
//!
//! [`TetherbandError`] covers every failure the engine can surface to a
//! caller. Modules keep their own specific error types ([`ConfigError`],
//! [`TransportError`], [`PairingError`]) and convert into this one at the
//! crate boundary.
//!
//! Most engine failures never reach a caller: link loss, read failures and
//! malformed notifications are handled inside the session and logged.
//!
//! [`ConfigError`]: crate::config::ConfigError
//! [`TransportError`]: crate::transport::TransportError
//! [`PairingError`]: crate::pairing::PairingError

use thiserror::Error;

use crate::types::BeaconId;

/// The unified error type for tetherband operations.
#[derive(Debug, Error)]
pub enum TetherbandError {
    // =========================================================================
    // TRANSPORT ERRORS
    // =========================================================================
    /// No Bluetooth adapter is available.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and bluetoothd is running."
    )]
    AdapterUnavailable,

    /// The adapter exists but is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    AdapterPoweredOff,

    /// Scanning could not be started or stopped.
    #[error("Bluetooth scan failed: {0}")]
    ScanFailed(String),

    /// A GATT or link operation failed.
    #[error("Bluetooth operation failed: {0}")]
    TransportFailed(String),

    // =========================================================================
    // ENGINE ERRORS
    // =========================================================================
    /// No beacon with this index is registered.
    #[error("Beacon {0} not found")]
    BeaconNotFound(BeaconId),

    /// The beacon exists but has no usable connection.
    #[error("Beacon {0} is not connected")]
    BeaconNotConnected(BeaconId),

    /// The pairing identifier was rejected.
    #[error("Invalid pairing identifier: {0}")]
    InvalidPairing(String),

    /// A label was blank or too long.
    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    /// The tracker task has stopped.
    #[error("Tracking engine is not running")]
    EngineUnavailable,

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found.
    #[error("Configuration file not found: {0}")]
    ConfigNotFound(String),

    /// A configuration layer could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // I/O ERRORS
    // =========================================================================
    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for tetherband operations.
pub type Result<T> = std::result::Result<T, TetherbandError>;

impl TetherbandError {
    /// Returns `true` if this error came from the Bluetooth transport.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::AdapterUnavailable
                | Self::AdapterPoweredOff
                | Self::ScanFailed(_)
                | Self::TransportFailed(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if retrying later may succeed without user action.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ScanFailed(_) | Self::TransportFailed(_) | Self::BeaconNotConnected(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::InvalidPairing(_) | Self::InvalidLabel(_) => 400,

            // 404 Not Found
            Self::BeaconNotFound(_) | Self::ConfigNotFound(_) => 404,

            // 409 Conflict - valid request, wrong state
            Self::BeaconNotConnected(_) => 409,

            // 422 Unprocessable Entity
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error
            Self::IoError(_) => 500,

            // 503 Service Unavailable - hardware or engine down
            Self::AdapterUnavailable
            | Self::AdapterPoweredOff
            | Self::ScanFailed(_)
            | Self::TransportFailed(_)
            | Self::EngineUnavailable => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::AdapterUnavailable => "ADAPTER_UNAVAILABLE",
            Self::AdapterPoweredOff => "ADAPTER_POWERED_OFF",
            Self::ScanFailed(_) => "SCAN_FAILED",
            Self::TransportFailed(_) => "TRANSPORT_FAILED",
            Self::BeaconNotFound(_) => "BEACON_NOT_FOUND",
            Self::BeaconNotConnected(_) => "BEACON_NOT_CONNECTED",
            Self::InvalidPairing(_) => "INVALID_PAIRING_IDENTIFIER",
            Self::InvalidLabel(_) => "INVALID_LABEL",
            Self::EngineUnavailable => "ENGINE_UNAVAILABLE",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for TetherbandError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::WriteError { path, source } => {
                Self::IoError(std::io::Error::new(source.kind(), format!("{path}: {source}")))
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::transport::TransportError> for TetherbandError {
    fn from(err: crate::transport::TransportError) -> Self {
        use crate::transport::TransportError;
        match err {
            TransportError::AdapterUnavailable => Self::AdapterUnavailable,
            TransportError::AdapterPoweredOff => Self::AdapterPoweredOff,
            TransportError::ScanFailed(message) => Self::ScanFailed(message),
            other => Self::TransportFailed(other.to_string()),
        }
    }
}

impl From<crate::pairing::PairingError> for TetherbandError {
    fn from(err: crate::pairing::PairingError) -> Self {
        Self::InvalidPairing(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
