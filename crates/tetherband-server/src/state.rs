//! Application state shared across handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tetherband_core::{Config, MemoryAlertSink, TrackerHandle};

/// State handed to every handler.
#[derive(Debug)]
pub struct AppState {
    /// Loaded configuration. Read-only while the daemon runs.
    pub config: Arc<Config>,
    /// Handle to the tracking engine.
    pub tracker: TrackerHandle,
    /// Alerts currently shown to the user.
    pub alerts: Arc<MemoryAlertSink>,
    /// When the server started.
    pub started_at_utc: DateTime<Utc>,
}

/// Shared application state.
pub type SharedState = Arc<AppState>;

impl AppState {
    /// Create shared state around a running tracker.
    #[must_use]
    pub fn shared(
        config: Arc<Config>,
        tracker: TrackerHandle,
        alerts: Arc<MemoryAlertSink>,
    ) -> SharedState {
        Arc::new(Self {
            config,
            tracker,
            alerts,
            started_at_utc: Utc::now(),
        })
    }
}
