//! Logging initialization.
//!
//! - **Production**: JSON logs to rolling files + compact logs to stdout
//! - **Development**: Pretty logs to stdout with span events
//!
//! The level comes from `RUST_LOG`, then `TETHERBAND_LOG_LEVEL`, then the
//! `logging.level` config value.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tetherband_core::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable overriding the configured log level.
pub const LOG_LEVEL_ENV: &str = "TETHERBAND_LOG_LEVEL";

/// Guards that keep the non-blocking writers flushing until exit.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the logging system.
///
/// # Production Mode
///
/// - Logs to rolling daily files in `/var/log/tetherband/`
/// - Also logs to stdout for systemd journal capture
/// - JSON format in files, compact format without ANSI colors on stdout
///
/// # Development Mode
///
/// - Pretty stdout logs with span events
///
/// # Errors
///
/// Returns an error if the level cannot be parsed as a filter.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(resolve_level(config)))?;

    if config.production {
        init_production(env_filter);
    } else {
        init_development(env_filter);
    }

    Ok(())
}

/// Level used when `RUST_LOG` is unset.
fn resolve_level(config: &LoggingConfig) -> String {
    std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| config.level.clone())
}

/// Initialize production logging with file + stdout output.
fn init_production(env_filter: EnvFilter) {
    let log_dir = log_directory();

    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir).ok();
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "tetherband");

    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    // JSON lines for the files
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_stdout)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);
}

/// Initialize development logging with pretty stdout output.
fn init_development(env_filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

/// Returns the appropriate log directory for the current platform.
fn log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/tetherband")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "tetherband")
            .map(|dirs| dirs.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("./logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_is_valid_path() {
        let dir = log_directory();
        assert!(!dir.as_os_str().is_empty());
        assert!(dir.to_string_lossy().contains("tetherband"));
    }

    #[test]
    fn test_level_falls_back_to_config() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            ..LoggingConfig::default()
        };
        if std::env::var(LOG_LEVEL_ENV).is_err() {
            assert_eq!(resolve_level(&config), "debug");
        }
        assert!(EnvFilter::try_new(resolve_level(&config)).is_ok());
    }
}
