//! # tetherband-server
//!
//! Daemon hosting the tetherband tracking engine.
//!
//! This binary provides:
//! - The tracking engine on the local Bluetooth adapter
//! - REST API for pairing, status, control and alerts
//! - Structured logging to file and stdout, plus an optional event log
//!
//! ## Running
//!
//! ```bash
//! # Development (mock transport, no radio)
//! cargo run --package tetherband-server --no-default-features --features mock-bluetooth
//!
//! # Production
//! cargo build --release --package tetherband-server
//! ./tetherband-server /etc/tetherband/config.toml
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tetherband_core::config::default_config_path;
use tetherband_core::transport::TransportEventSender;
use tetherband_core::{
    event_channel, Config, EventLog, EventLogger, FileEventLog, MemoryAlertSink, Tracker,
    TracingEventLog, Transport,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

use tetherband_server::api::create_router;
use tetherband_server::logging;
use tetherband_server::state::AppState;

#[cfg(not(any(feature = "bluetooth", feature = "mock-bluetooth")))]
compile_error!("enable the `bluetooth` or `mock-bluetooth` feature");

/// Environment variable naming the configuration file.
const CONFIG_PATH_ENV: &str = "TETHERBAND_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config_path()?;
    let config = Config::load(Some(&config_path))
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    logging::init(&config.logging)?;
    info!(config = %config_path.display(), "Starting tetherband-server");

    let config = Arc::new(config);
    let (file_log, events) = event_logger(&config).await?;

    let (transport_tx, transport_rx) = event_channel();
    let transport = build_transport(transport_tx).await?;
    let alerts = Arc::new(MemoryAlertSink::new());
    let (tracker, tracker_task) = Tracker::spawn(
        config.clone(),
        transport,
        transport_rx,
        alerts.clone(),
        events,
    );

    let app = create_router(AppState::shared(config.clone(), tracker.clone(), alerts));

    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .context("parsing server bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down tracker");
    if let Err(e) = tracker.shutdown().await {
        warn!(error = %e, "Tracker already stopped");
    }
    if let Err(e) = tracker_task.await {
        warn!(error = %e, "Tracker task failed");
    }
    if let Some(file_log) = file_log {
        file_log.flush().await;
    }

    Ok(())
}

/// Config file from the first argument, `TETHERBAND_CONFIG`, or the platform default.
fn config_path() -> anyhow::Result<PathBuf> {
    if let Some(arg) = std::env::args_os().nth(1) {
        return Ok(PathBuf::from(arg));
    }
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    default_config_path().context("resolving default configuration path")
}

async fn event_logger(config: &Config) -> anyhow::Result<(Option<Arc<FileEventLog>>, EventLogger)> {
    let timezone = config.logging.timezone;
    match &config.logging.event_log_path {
        Some(path) => {
            let file = Arc::new(
                FileEventLog::open(path)
                    .await
                    .with_context(|| format!("opening event log {}", path.display()))?,
            );
            info!(path = %path.display(), "Event log enabled");
            let sink: Arc<dyn EventLog> = file.clone();
            Ok((Some(file), EventLogger::new(sink, timezone)))
        }
        None => Ok((None, EventLogger::new(Arc::new(TracingEventLog), timezone))),
    }
}

#[cfg(feature = "bluetooth")]
async fn build_transport(events: TransportEventSender) -> anyhow::Result<Arc<dyn Transport>> {
    let transport = tetherband_core::BluezTransport::new(events)
        .await
        .context("opening Bluetooth adapter")?;
    Ok(Arc::new(transport))
}

#[cfg(all(feature = "mock-bluetooth", not(feature = "bluetooth")))]
#[allow(clippy::unused_async)]
async fn build_transport(events: TransportEventSender) -> anyhow::Result<Arc<dyn Transport>> {
    warn!("Built without the `bluetooth` feature; using an empty mock transport");
    Ok(Arc::new(tetherband_core::MockTransport::new(events)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
