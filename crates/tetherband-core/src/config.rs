//! Deployment configuration.
//!
//! Values are layered in this order, later layers winning:
//!
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. `TETHERBAND__<SECTION>__<KEY>` environment variables
//!
//! Sections:
//! - `tracking` - path-loss model, range limit, debounce and sampling cadence
//! - `commands` - hardware command bytes written to the identify characteristic
//! - `sensor` - capacitive-sense event codes
//! - `server` - HTTP bind address
//! - `logging` - log level, production mode, event log file and timezone

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TETHERBAND";

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// The file could not be written.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// File path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A layer could not be merged or deserialized.
    #[error("Failed to load configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// The configuration could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field holds an invalid value.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted field path, e.g. `tracking.max_distance_mm`.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Proximity tracking parameters.
    pub tracking: TrackingConfig,
    /// Hardware command byte table.
    pub commands: CommandBytes,
    /// Capacitive-sense event codes.
    pub sensor: SensorCodes,
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Proximity tracking parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Path-loss exponent of the distance model (reference range 20.0 to 21.5).
    pub path_loss_exponent: f64,
    /// Distances beyond this are out of range.
    pub max_distance_mm: f64,
    /// Consecutive out-of-range readings needed to confirm.
    pub out_of_range_debounce: u32,
    /// RSSI samples per batch.
    pub samples_per_batch: usize,
    /// Delay between two RSSI reads.
    pub sample_spacing_ms: u64,
    /// Watchdog bounding one batch.
    pub sample_window_ms: u64,
    /// Pause between batches while in range.
    pub in_range_interval_secs: u64,
    /// Transmit power used when the beacon does not report one.
    pub fallback_tx_power: i8,
    /// Pause before rescanning after a failed reconnect.
    pub reconnect_backoff_secs: u64,
    /// Start sampling as soon as a session is ready.
    pub auto_start: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            path_loss_exponent: 20.0,
            max_distance_mm: 3_000.0,
            out_of_range_debounce: 2,
            samples_per_batch: 20,
            sample_spacing_ms: 1,
            sample_window_ms: 50,
            in_range_interval_secs: 3,
            fallback_tx_power: 0,
            reconnect_backoff_secs: 2,
            auto_start: true,
        }
    }
}

impl TrackingConfig {
    /// Delay between two RSSI reads.
    #[must_use]
    pub const fn sample_spacing(&self) -> Duration {
        Duration::from_millis(self.sample_spacing_ms)
    }

    /// Watchdog window of one batch.
    #[must_use]
    pub const fn sample_window(&self) -> Duration {
        Duration::from_millis(self.sample_window_ms)
    }

    /// Pause between batches while in range.
    #[must_use]
    pub const fn in_range_interval(&self) -> Duration {
        Duration::from_secs(self.in_range_interval_secs)
    }

    /// Pause before rescanning after a failed reconnect.
    #[must_use]
    pub const fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

/// Bytes written to the identify characteristic to drive the bracelet.
///
/// The defaults are placeholders; real values depend on the firmware build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandBytes {
    /// Connected, default colour (also used after a reconnect).
    pub connected_default: u8,
    /// Connected, team colour (fresh pairing).
    pub connected_team_color: u8,
    /// Out-of-range indicator.
    pub out_of_range: u8,
    /// Back-in-range indicator.
    pub back_in_range: u8,
    /// Start the emergency pattern.
    pub emergency_start: u8,
    /// Stop the emergency pattern.
    pub emergency_stop: u8,
    /// Power the bracelet off.
    pub power_off: u8,
}

impl Default for CommandBytes {
    fn default() -> Self {
        Self {
            connected_default: 0x00,
            connected_team_color: 0x01,
            out_of_range: 0x02,
            back_in_range: 0x03,
            emergency_start: 0x04,
            emergency_stop: 0x05,
            power_off: 0x06,
        }
    }
}

impl CommandBytes {
    fn named(&self) -> [(&'static str, u8); 7] {
        [
            ("connected_default", self.connected_default),
            ("connected_team_color", self.connected_team_color),
            ("out_of_range", self.out_of_range),
            ("back_in_range", self.back_in_range),
            ("emergency_start", self.emergency_start),
            ("emergency_stop", self.emergency_stop),
            ("power_off", self.power_off),
        ]
    }
}

/// Capacitive-sense event codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorCodes {
    /// Skin contact detected.
    pub worn_on: u8,
    /// Skin contact lost.
    pub worn_off: u8,
}

impl Default for SensorCodes {
    fn default() -> Self {
        Self {
            worn_on: 0x01,
            worn_off: 0x00,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub bind_address: String,
    /// TCP port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `TETHERBAND_LOG_LEVEL` and `RUST_LOG` are unset.
    pub level: String,
    /// JSON file logging instead of pretty stdout.
    pub production: bool,
    /// Append-only event log; `None` forwards events to tracing only.
    pub event_log_path: Option<PathBuf>,
    /// Timezone of event log timestamps.
    #[serde(with = "timezone_serde")]
    pub timezone: Tz,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            production: false,
            event_log_path: None,
            timezone: chrono_tz::UTC,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// A missing file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] if a layer is malformed, or a
    /// validation error if the merged values are invalid.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        let merged = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = merged.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let display = path.display().to_string();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: display.clone(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: display,
            source,
        })
    }

    /// Check every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns the single [`ConfigError::ValidationError`] or a
    /// [`ConfigError::MultipleValidationErrors`] listing all of them.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &str, message: String| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message,
            });
        };

        let tracking = &self.tracking;
        if !tracking.path_loss_exponent.is_finite() || tracking.path_loss_exponent <= 0.0 {
            invalid(
                "tracking.path_loss_exponent",
                format!("must be a positive number (got {})", tracking.path_loss_exponent),
            );
        }
        if !tracking.max_distance_mm.is_finite() || tracking.max_distance_mm <= 0.0 {
            invalid(
                "tracking.max_distance_mm",
                format!("must be a positive number (got {})", tracking.max_distance_mm),
            );
        }
        if tracking.out_of_range_debounce == 0 {
            invalid("tracking.out_of_range_debounce", "must be at least 1".into());
        }
        if !(1..=1_000).contains(&tracking.samples_per_batch) {
            invalid(
                "tracking.samples_per_batch",
                format!("must be between 1 and 1000 (got {})", tracking.samples_per_batch),
            );
        }
        if tracking.sample_window_ms == 0 {
            invalid("tracking.sample_window_ms", "must be at least 1".into());
        }
        if tracking.in_range_interval_secs == 0 {
            invalid("tracking.in_range_interval_secs", "must be at least 1".into());
        }

        let mut seen: HashMap<u8, &str> = HashMap::new();
        for (name, byte) in self.commands.named() {
            if let Some(other) = seen.insert(byte, name) {
                invalid(
                    &format!("commands.{name}"),
                    format!("0x{byte:02X} is already used by commands.{other}"),
                );
            }
        }

        if self.sensor.worn_on == self.sensor.worn_off {
            invalid(
                "sensor.worn_off",
                format!("must differ from sensor.worn_on (both 0x{:02X})", self.sensor.worn_on),
            );
        }

        if self.server.port == 0 {
            invalid("server.port", "must not be 0".into());
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            invalid(
                "logging.level",
                format!(
                    "'{}' is not one of {}",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            );
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Default configuration file location.
///
/// On the target device: `/etc/tetherband/config.toml`.
/// Elsewhere: the platform config directory, e.g. `~/.config/tetherband/config.toml`.
///
/// # Errors
///
/// Returns [`ConfigError::NotFound`] if no config directory can be determined.
pub fn default_config_path() -> ConfigResult<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/tetherband/config.toml"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let dirs = directories::ProjectDirs::from("", "", "tetherband")
            .ok_or_else(|| ConfigError::NotFound("Cannot determine config directory".into()))?;
        Ok(dirs.config_dir().join("config.toml"))
    }
}

/// Check whether a string names an IANA timezone.
#[must_use]
pub fn is_valid_timezone(name: &str) -> bool {
    name.parse::<Tz>().is_ok()
}

mod timezone_serde {
    use chrono_tz::Tz;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(tz.name())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Tz, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
