//! Append-only event log.
//!
//! Engine milestones (pairing, connects, range and worn transitions) are
//! recorded as timestamped lines such as:
//!
//! ```text
//! 2025-01-15 03:30:00.123 Nick is out of range (3.12 m)
//! ```
//!
//! Recording never blocks and never fails; write errors are logged.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Timestamp format of event log lines.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Fire-and-forget line sink.
pub trait EventLog: Send + Sync {
    /// Append one already timestamped line.
    fn record(&self, line: String);
}

/// Forwards lines to `tracing` at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn record(&self, line: String) {
        info!(target: "tetherband::events", "{line}");
    }
}

enum WriterMessage {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Appends lines to a file from a background task.
#[derive(Debug, Clone)]
pub struct FileEventLog {
    path: PathBuf,
    tx: mpsc::UnboundedSender<WriterMessage>,
}

impl std::fmt::Debug for WriterMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Line(line) => f.debug_tuple("Line").field(line).finish(),
            Self::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl FileEventLog {
    /// Open (or create) the log file and start the writer task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file or its parent directory cannot be
    /// created.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<WriterMessage>();
        let task_path = path.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    WriterMessage::Line(mut line) => {
                        line.push('\n');
                        if let Err(e) = file.write_all(line.as_bytes()).await {
                            warn!(path = %task_path.display(), error = %e, "Failed to append event log line");
                        }
                    }
                    WriterMessage::Flush(ack) => {
                        if let Err(e) = file.flush().await {
                            warn!(path = %task_path.display(), error = %e, "Failed to flush event log");
                        }
                        let _ = ack.send(());
                    }
                }
            }
        });

        Ok(Self { path, tx })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every line recorded so far has been written.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(WriterMessage::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

impl EventLog for FileEventLog {
    fn record(&self, line: String) {
        if self.tx.send(WriterMessage::Line(line)).is_err() {
            warn!(path = %self.path.display(), "Event log writer has stopped");
        }
    }
}

/// Prefixes messages with a local timestamp before recording them.
#[derive(Clone)]
pub struct EventLogger {
    sink: Arc<dyn EventLog>,
    timezone: Tz,
}

impl EventLogger {
    /// Create a logger writing to `sink` with timestamps in `timezone`.
    pub fn new(sink: Arc<dyn EventLog>, timezone: Tz) -> Self {
        Self { sink, timezone }
    }

    /// Logger that only forwards to `tracing`.
    #[must_use]
    pub fn tracing_only() -> Self {
        Self::new(Arc::new(TracingEventLog), chrono_tz::UTC)
    }

    /// Record a message stamped with the current time.
    pub fn log(&self, message: impl AsRef<str>) {
        self.sink
            .record(format_line(Utc::now(), self.timezone, message.as_ref()));
    }
}

impl std::fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogger")
            .field("timezone", &self.timezone)
            .finish_non_exhaustive()
    }
}

/// Render one event log line.
#[must_use]
pub fn format_line(at: DateTime<Utc>, timezone: Tz, message: &str) -> String {
    format!(
        "{} {message}",
        at.with_timezone(&timezone).format(TIMESTAMP_FORMAT)
    )
}
