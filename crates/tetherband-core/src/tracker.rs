//! The tracker actor.
//!
//! Owns the [`ConnectionRegistry`], the [`AlertDispatcher`] and the pending
//! pairing. It consumes three inputs in one loop:
//!
//! - [`TrackerCommand`]s from [`TrackerHandle`]s (API callers)
//! - [`TransportEvent`]s from the radio (sightings, link loss, notifications)
//! - [`SessionEvent`]s from beacon sessions
//!
//! Sessions never touch the registry; the tracker applies their events.
//!
//! A rescan that fails to start is retried after the reconnect backoff for as
//! long as any beacon is waiting to be sighted again.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alerts::{AlertDispatcher, AlertSink, ConditionKind};
use crate::config::Config;
use crate::error::{Result, TetherbandError};
use crate::eventlog::EventLogger;
use crate::pairing::{PairingIdentifier, PairingRequest};
use crate::range::RangeEvent;
use crate::registry::{ConnectionRegistry, Sighting};
use crate::session::{BeaconSession, SessionCommand, SessionContext, SessionEvent, SessionEventKind};
use crate::transport::{Transport, TransportEvent, TransportEventReceiver};
use crate::types::{Advertisement, BeaconId, BeaconStatus, ConnectionState};
use crate::worn::WornEvent;

/// Capacity of the tracker command queue.
pub const TRACKER_COMMAND_CAPACITY: usize = 64;

/// Longest accepted beacon label, in characters.
pub const MAX_LABEL_CHARS: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests handled by the tracker.
#[derive(Debug)]
pub enum TrackerCommand {
    /// Start looking for a beacon to pair.
    Pair {
        /// Pairing input.
        request: PairingRequest,
        /// Completion.
        reply: Reply<()>,
    },
    /// Begin sampling a beacon.
    StartTracking {
        /// Target beacon.
        beacon: BeaconId,
        /// Completion.
        reply: Reply<()>,
    },
    /// Stop sampling a beacon.
    StopTracking {
        /// Target beacon.
        beacon: BeaconId,
        /// Completion.
        reply: Reply<()>,
    },
    /// Set or clear a beacon's label.
    SetLabel {
        /// Target beacon.
        beacon: BeaconId,
        /// New label; `None` clears it.
        label: Option<String>,
        /// Updated status.
        reply: Reply<BeaconStatus>,
    },
    /// Start or stop the emergency pattern.
    Emergency {
        /// Target beacon.
        beacon: BeaconId,
        /// Start (`true`) or stop.
        active: bool,
        /// Completion.
        reply: Reply<()>,
    },
    /// Power a bracelet off.
    PowerOff {
        /// Target beacon.
        beacon: BeaconId,
        /// Completion.
        reply: Reply<()>,
    },
    /// Status of every beacon.
    Snapshot {
        /// Statuses in id order.
        reply: oneshot::Sender<Vec<BeaconStatus>>,
    },
    /// Status of one beacon.
    Status {
        /// Target beacon.
        beacon: BeaconId,
        /// The status.
        reply: Reply<BeaconStatus>,
    },
    /// Tear down every session and forget every beacon.
    DisconnectAll {
        /// Number of beacons removed.
        reply: oneshot::Sender<usize>,
    },
    /// Disconnect everything and stop the tracker.
    Shutdown {
        /// Completion.
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle for talking to the tracker.
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    commands: mpsc::Sender<TrackerCommand>,
}

impl TrackerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> TrackerCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| TetherbandError::EngineUnavailable)?;
        rx.await.map_err(|_| TetherbandError::EngineUnavailable)
    }

    /// Start scanning for a beacon to pair. A pending pairing is replaced.
    ///
    /// # Errors
    ///
    /// Fails if the scan cannot be started.
    pub async fn pair(&self, request: PairingRequest) -> Result<()> {
        self.request(|reply| TrackerCommand::Pair { request, reply }).await?
    }

    /// Begin periodic sampling of a beacon.
    ///
    /// # Errors
    ///
    /// Fails if the beacon is unknown.
    pub async fn start_tracking(&self, beacon: BeaconId) -> Result<()> {
        self.request(|reply| TrackerCommand::StartTracking { beacon, reply })
            .await?
    }

    /// Stop periodic sampling of a beacon.
    ///
    /// # Errors
    ///
    /// Fails if the beacon is unknown.
    pub async fn stop_tracking(&self, beacon: BeaconId) -> Result<()> {
        self.request(|reply| TrackerCommand::StopTracking { beacon, reply })
            .await?
    }

    /// Set or clear a beacon's label.
    ///
    /// # Errors
    ///
    /// Fails if the beacon is unknown or the label is blank or too long.
    pub async fn set_label(&self, beacon: BeaconId, label: Option<String>) -> Result<BeaconStatus> {
        self.request(|reply| TrackerCommand::SetLabel {
            beacon,
            label,
            reply,
        })
        .await?
    }

    /// Start or stop the emergency pattern.
    ///
    /// # Errors
    ///
    /// Fails if the beacon is unknown or not connected.
    pub async fn emergency(&self, beacon: BeaconId, active: bool) -> Result<()> {
        self.request(|reply| TrackerCommand::Emergency {
            beacon,
            active,
            reply,
        })
        .await?
    }

    /// Power a bracelet off.
    ///
    /// # Errors
    ///
    /// Fails if the beacon is unknown or not connected.
    pub async fn power_off(&self, beacon: BeaconId) -> Result<()> {
        self.request(|reply| TrackerCommand::PowerOff { beacon, reply })
            .await?
    }

    /// Status of every beacon, in id order.
    ///
    /// # Errors
    ///
    /// Fails if the tracker has stopped.
    pub async fn beacons(&self) -> Result<Vec<BeaconStatus>> {
        self.request(|reply| TrackerCommand::Snapshot { reply }).await
    }

    /// Status of one beacon.
    ///
    /// # Errors
    ///
    /// Fails if the beacon is unknown.
    pub async fn beacon(&self, beacon: BeaconId) -> Result<BeaconStatus> {
        self.request(|reply| TrackerCommand::Status { beacon, reply })
            .await?
    }

    /// Tear down every session. Returns how many beacons were removed.
    ///
    /// # Errors
    ///
    /// Fails if the tracker has stopped.
    pub async fn disconnect_all(&self) -> Result<usize> {
        self.request(|reply| TrackerCommand::DisconnectAll { reply })
            .await
    }

    /// Disconnect everything and stop the tracker.
    ///
    /// # Errors
    ///
    /// Fails if the tracker had already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| TrackerCommand::Shutdown { reply }).await
    }
}

/// Trim and check a user label.
///
/// # Errors
///
/// Returns [`TetherbandError::InvalidLabel`] for blank or overlong labels.
pub fn normalize_label(label: &str) -> Result<String> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return Err(TetherbandError::InvalidLabel(
            "label must not be blank".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_LABEL_CHARS {
        return Err(TetherbandError::InvalidLabel(format!(
            "label must be at most {MAX_LABEL_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// The tracker actor.
pub struct Tracker {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    registry: ConnectionRegistry,
    dispatcher: AlertDispatcher,
    events: EventLogger,
    pending: Option<PairingRequest>,
    awaiting_rescan: BTreeSet<BeaconId>,
    rescan_retry: Option<Instant>,
    failed_connects: HashMap<PairingIdentifier, Vec<BeaconId>>,
    scanning: bool,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    transport_rx: TransportEventReceiver,
    command_rx: mpsc::Receiver<TrackerCommand>,
}

impl Tracker {
    /// Spawn the tracker. It runs until shut down or until every
    /// [`TrackerHandle`] is dropped.
    pub fn spawn(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        transport_rx: TransportEventReceiver,
        sink: Arc<dyn AlertSink>,
        events: EventLogger,
    ) -> (TrackerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(TRACKER_COMMAND_CAPACITY);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let tracker = Self {
            config,
            transport,
            registry: ConnectionRegistry::new(),
            dispatcher: AlertDispatcher::new(sink),
            events,
            pending: None,
            awaiting_rescan: BTreeSet::new(),
            rescan_retry: None,
            failed_connects: HashMap::new(),
            scanning: false,
            session_tx,
            session_rx,
            transport_rx,
            command_rx,
        };
        let task = tokio::spawn(tracker.run());
        (
            TrackerHandle {
                commands: command_tx,
            },
            task,
        )
    }

    async fn run(mut self) {
        info!("Tracker started");

        loop {
            let retry_at = self.rescan_retry;
            let retry_due = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(TrackerCommand::Shutdown { reply }) => {
                        self.disconnect_all().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.disconnect_all().await;
                        break;
                    }
                },
                Some(event) = self.session_rx.recv() => self.handle_session_event(event).await,
                Some(event) = self.transport_rx.recv() => self.handle_transport_event(event).await,
                () = retry_due => self.retry_rescans().await,
            }
        }

        info!("Tracker stopped");
    }

    async fn handle_command(&mut self, command: TrackerCommand) {
        match command {
            TrackerCommand::Pair { request, reply } => {
                let _ = reply.send(self.handle_pair(request).await);
            }
            TrackerCommand::StartTracking { beacon, reply } => {
                let _ = reply.send(self.forward(beacon, SessionCommand::StartTracking).await);
            }
            TrackerCommand::StopTracking { beacon, reply } => {
                let _ = reply.send(self.forward(beacon, SessionCommand::StopTracking).await);
            }
            TrackerCommand::SetLabel {
                beacon,
                label,
                reply,
            } => {
                let _ = reply.send(self.handle_set_label(beacon, label));
            }
            TrackerCommand::Emergency {
                beacon,
                active,
                reply,
            } => {
                let result = match self.require_ready(beacon) {
                    Ok(()) => self.forward(beacon, SessionCommand::Emergency(active)).await,
                    Err(e) => Err(e),
                };
                if result.is_ok() {
                    let verb = if active { "Started" } else { "Stopped" };
                    self.log_for(beacon, |name| format!("{verb} emergency on {name}"));
                }
                let _ = reply.send(result);
            }
            TrackerCommand::PowerOff { beacon, reply } => {
                let result = match self.require_ready(beacon) {
                    Ok(()) => self.forward(beacon, SessionCommand::PowerOff).await,
                    Err(e) => Err(e),
                };
                if result.is_ok() {
                    self.log_for(beacon, |name| format!("Powering off {name}"));
                }
                let _ = reply.send(result);
            }
            TrackerCommand::Snapshot { reply } => {
                let _ = reply.send(self.registry.statuses());
            }
            TrackerCommand::Status { beacon, reply } => {
                let status = self
                    .registry
                    .status(beacon)
                    .cloned()
                    .ok_or(TetherbandError::BeaconNotFound(beacon));
                let _ = reply.send(status);
            }
            TrackerCommand::DisconnectAll { reply } => {
                let removed = self.disconnect_all().await;
                let _ = reply.send(removed);
            }
            TrackerCommand::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    async fn handle_pair(&mut self, request: PairingRequest) -> Result<()> {
        if let Some(previous) = self.pending.replace(request.clone()) {
            info!(pairing = %previous.identifier, "Replacing pending pairing");
        }
        info!(pairing = %request.identifier, reconnect = request.reconnect, "Scanning for beacon");
        self.events
            .log(format!("Scanning for beacon {}", request.identifier));
        if let Err(e) = self.transport.scan(&request.identifier).await {
            self.pending = None;
            return Err(e.into());
        }
        self.scanning = true;
        Ok(())
    }

    fn handle_set_label(&mut self, beacon: BeaconId, label: Option<String>) -> Result<BeaconStatus> {
        let label = label.as_deref().map(normalize_label).transpose()?;
        if !self.registry.set_label(beacon, label.clone()) {
            return Err(TetherbandError::BeaconNotFound(beacon));
        }
        info!(%beacon, label = label.as_deref().unwrap_or(""), "Label updated");
        self.registry
            .status(beacon)
            .cloned()
            .ok_or(TetherbandError::BeaconNotFound(beacon))
    }

    fn require_ready(&self, beacon: BeaconId) -> Result<()> {
        let status = self
            .registry
            .status(beacon)
            .ok_or(TetherbandError::BeaconNotFound(beacon))?;
        if status.connection.is_ready() {
            Ok(())
        } else {
            Err(TetherbandError::BeaconNotConnected(beacon))
        }
    }

    async fn forward(&self, beacon: BeaconId, command: SessionCommand) -> Result<()> {
        if self.registry.identity(beacon).is_none() {
            return Err(TetherbandError::BeaconNotFound(beacon));
        }
        let Some(session) = self.registry.session(beacon) else {
            return Err(TetherbandError::BeaconNotConnected(beacon));
        };
        if session.send(command).await {
            Ok(())
        } else {
            Err(TetherbandError::BeaconNotConnected(beacon))
        }
    }

    fn log_for(&self, beacon: BeaconId, message: impl FnOnce(&str) -> String) {
        if let Some(identity) = self.registry.identity(beacon) {
            self.events.log(message(identity.display_name()));
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Advertisement(advertisement) => {
                self.handle_advertisement(advertisement).await;
            }
            TransportEvent::Disconnected { handle, reason } => {
                let Some(beacon) = self.registry.find_by_handle(&handle) else {
                    debug!(%handle, "Disconnect from untracked peripheral");
                    return;
                };
                if let Some(session) = self.registry.session(beacon) {
                    session.send(SessionCommand::LinkLost(reason)).await;
                }
            }
            TransportEvent::Notification {
                handle,
                characteristic,
                payload,
            } => {
                let Some(beacon) = self.registry.find_by_handle(&handle) else {
                    debug!(%handle, "Notification from untracked peripheral");
                    return;
                };
                if let Some(session) = self.registry.session(beacon) {
                    session
                        .send(SessionCommand::Notification {
                            characteristic,
                            payload,
                        })
                        .await;
                }
            }
        }
    }

    async fn handle_advertisement(&mut self, advertisement: Advertisement) {
        let name = advertisement.display_name().to_string();
        debug!(handle = %advertisement.handle, %name, rssi = ?advertisement.rssi, "Sighting");

        if let Some(beacon) = self.registry.id_by_name(&name) {
            if self.awaiting_rescan.remove(&beacon) {
                info!(%beacon, handle = %advertisement.handle, "Beacon sighted again; reconnecting");
                self.registry.set_handle(beacon, advertisement.handle.clone());
                if let Some(session) = self.registry.session(beacon) {
                    session
                        .send(SessionCommand::Attach(advertisement.handle))
                        .await;
                }
            }
            self.stop_scan_if_idle().await;
            return;
        }

        let Some(request) = self.pending.take() else {
            return;
        };
        let Sighting::New(beacon) = self
            .registry
            .register_sighting(&advertisement, &request.identifier)
        else {
            return;
        };
        info!(%beacon, %name, handle = %advertisement.handle, "Pairing beacon");
        self.events.log(format!("Connecting to {name}"));

        let context = SessionContext {
            config: self.config.clone(),
            transport: self.transport.clone(),
            events: self.session_tx.clone(),
        };
        let session = BeaconSession::spawn(beacon, name, request, advertisement.handle, context);
        self.registry.attach_session(beacon, session);
        self.stop_scan_if_idle().await;
    }

    /// Whether sampling depends on a running scan right now.
    fn scan_needed_for_sampling(&self) -> bool {
        self.transport.signal_strength_needs_scan() && self.registry.any_tracking()
    }

    async fn stop_scan_if_idle(&mut self) {
        if !self.scanning
            || self.pending.is_some()
            || !self.awaiting_rescan.is_empty()
            || self.scan_needed_for_sampling()
        {
            return;
        }
        match self.transport.stop_scan().await {
            Ok(()) => {
                self.scanning = false;
                debug!("Scan stopped");
            }
            Err(e) => warn!(error = %e, "Failed to stop scan"),
        }
    }

    /// Start a scan on behalf of beacons already registered. A failure arms
    /// the retry timer instead of surfacing to a caller.
    async fn rescan(&mut self, pairing: &PairingIdentifier) -> bool {
        match self.transport.scan(pairing).await {
            Ok(()) => {
                self.scanning = true;
                true
            }
            Err(e) => {
                let backoff = self.config.tracking.reconnect_backoff();
                warn!(%pairing, error = %e, retry_in = ?backoff, "Rescan failed");
                self.rescan_retry.get_or_insert_with(|| Instant::now() + backoff);
                false
            }
        }
    }

    async fn retry_rescans(&mut self) {
        self.rescan_retry = None;
        let mut pairings: Vec<PairingIdentifier> = Vec::new();
        for beacon in &self.awaiting_rescan {
            if let Some(identity) = self.registry.identity(*beacon) {
                if !pairings.contains(&identity.pairing) {
                    pairings.push(identity.pairing.clone());
                }
            }
        }
        if !pairings.is_empty() {
            info!(pending = pairings.len(), "Retrying rescan");
        }
        for pairing in pairings {
            if !self.rescan(&pairing).await {
                return;
            }
        }
        self.ensure_sampling_scan().await;
    }

    /// Keep a scan running for every tracked beacon when the transport only
    /// refreshes signal strength while scanning.
    async fn ensure_sampling_scan(&mut self) {
        if self.scanning || !self.scan_needed_for_sampling() {
            return;
        }
        debug!("Scanning to keep signal strength current");
        for pairing in self.registry.tracked_pairings() {
            if !self.rescan(&pairing).await {
                return;
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        let beacon = event.beacon;
        let Some(identity) = self.registry.identity(beacon).cloned() else {
            debug!(%beacon, "Event from removed beacon");
            return;
        };
        self.registry.apply(beacon, &event.kind);
        let name = identity.display_name();

        match event.kind {
            SessionEventKind::Connection {
                state: ConnectionState::Ready,
                reconnects,
            } => {
                if reconnects == 0 {
                    self.events.log(format!("Connected to {name}"));
                } else {
                    self.events.log(format!("Reconnected to {name}"));
                }
                if let Some(failed) = self.failed_connects.remove(&identity.pairing) {
                    debug!(%beacon, withdrawn = failed.len(), "Clearing earlier connect failures");
                    for earlier in failed {
                        self.dispatcher.forget_beacon(earlier);
                    }
                }
            }
            SessionEventKind::Connection {
                state: ConnectionState::Reconnecting,
                ..
            } => {
                self.registry.clear_handle(beacon);
                self.events.log(format!("Lost connection to {name}"));
            }
            SessionEventKind::ConnectFailed { reason } => {
                self.events.log(format!("Failed to connect to {name}: {reason}"));
                self.dispatcher.raise(beacon, name, ConditionKind::ConnectFailed);
                self.failed_connects
                    .entry(identity.pairing.clone())
                    .or_default()
                    .push(beacon);
                if let Some(Some(session)) = self.registry.remove(beacon) {
                    session.shutdown().await;
                }
                self.awaiting_rescan.remove(&beacon);
                self.stop_scan_if_idle().await;
            }
            SessionEventKind::Distance {
                distance_mm,
                transition: Some(transition),
                ..
            } => match transition {
                RangeEvent::OutOfRangeConfirmed { entered: true } => {
                    self.events.log(format!(
                        "{name} is out of range ({})",
                        crate::filter::format_distance(distance_mm)
                    ));
                    self.dispatcher.raise(beacon, name, ConditionKind::OutOfRange);
                }
                RangeEvent::OutOfRangeConfirmed { entered: false } => {
                    self.dispatcher.raise(beacon, name, ConditionKind::OutOfRange);
                }
                RangeEvent::Recovered => {
                    self.events.log(format!("{name} is back in range"));
                    self.dispatcher.raise(beacon, name, ConditionKind::BackInRange);
                }
            },
            SessionEventKind::Worn { transition, .. } => {
                let kind = match transition {
                    WornEvent::PutOn => {
                        self.events.log(format!("{name} was put on"));
                        ConditionKind::BraceletOn
                    }
                    WornEvent::Removed => {
                        self.events.log(format!("{name} was taken off"));
                        ConditionKind::BraceletRemoved
                    }
                };
                self.dispatcher.raise(beacon, name, kind);
            }
            SessionEventKind::Tracking(true) => self.ensure_sampling_scan().await,
            SessionEventKind::Tracking(false) => self.stop_scan_if_idle().await,
            SessionEventKind::RescanRequested => {
                self.awaiting_rescan.insert(beacon);
                self.rescan(&identity.pairing).await;
            }
            _ => {}
        }
    }

    /// Tear down every session: cancel, join, then disconnect.
    async fn disconnect_all(&mut self) -> usize {
        let entries = self.registry.drain();
        let removed = entries.len();
        for (beacon, session) in entries {
            if let Some(session) = session {
                session.shutdown().await;
            }
            self.dispatcher.forget_beacon(beacon);
        }
        self.pending = None;
        self.awaiting_rescan.clear();
        self.rescan_retry = None;
        if self.scanning {
            if let Err(e) = self.transport.stop_scan().await {
                warn!(error = %e, "Failed to stop scan");
            }
            self.scanning = false;
        }
        if removed > 0 {
            info!(removed, "Disconnected all beacons");
            self.events.log(format!("Disconnected {removed} beacon(s)"));
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::alerts::MemoryAlertSink;
    use crate::pairing::PairingIdentifier;
    use crate::transport::event_channel;
    use crate::transport::mock::{MockPeripheral, MockTransport, MOCK_IDENTIFY_CHARACTERISTIC};
    use crate::types::{RangeState, WornState};

    struct Harness {
        tracker: TrackerHandle,
        transport: Arc<MockTransport>,
        sink: Arc<MemoryAlertSink>,
        task: JoinHandle<()>,
    }

    fn pairing() -> PairingIdentifier {
        PairingIdentifier::new("180A").unwrap()
    }

    fn harness(peripherals: &[(&str, &str, i16)]) -> Harness {
        let (tx, rx) = event_channel();
        let transport = Arc::new(MockTransport::new(tx));
        for (handle, name, rssi) in peripherals {
            transport.add_peripheral(*handle, MockPeripheral::bracelet(*name, &pairing(), -12, *rssi));
        }
        let sink = Arc::new(MemoryAlertSink::new());
        let (tracker, task) = Tracker::spawn(
            Arc::new(Config::default()),
            transport.clone(),
            rx,
            sink.clone(),
            EventLogger::tracing_only(),
        );
        Harness {
            tracker,
            transport,
            sink,
            task,
        }
    }

    async fn wait_for_status(
        tracker: &TrackerHandle,
        mut pred: impl FnMut(&[BeaconStatus]) -> bool,
    ) -> Vec<BeaconStatus> {
        for _ in 0..2_000 {
            let statuses = tracker.beacons().await.unwrap();
            if pred(&statuses) {
                return statuses;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn settle(duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("  Nick ").unwrap(), "Nick");
        assert!(matches!(
            normalize_label("   "),
            Err(TetherbandError::InvalidLabel(_))
        ));
        assert_err!(normalize_label(&"x".repeat(MAX_LABEL_CHARS + 1)));
        assert_ok!(normalize_label(&"x".repeat(MAX_LABEL_CHARS)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_range_beacon_reports_distance_without_alert() {
        let h = harness(&[("AA", "Band-1", -50)]);
        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();

        let statuses = wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| b.distance_mm.is_some())
        })
        .await;
        let status = &statuses[0];
        assert!((status.distance_mm.unwrap() - 79.43).abs() < 0.01);
        assert_eq!(status.range, RangeState::InRange);
        assert_eq!(status.connection, ConnectionState::Ready);
        assert_eq!(status.tx_power, Some(-12));
        assert_eq!(status.battery_level, Some(87));
        assert!(status.tracking_started);
        assert!(h.sink.active().is_empty());
        assert!(!h.transport.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_writes_once_and_alerts_once() {
        let h = harness(&[("AA", "Band-1", -90)]);
        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();

        wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| b.range == RangeState::OutOfRange)
        })
        .await;
        settle(Duration::from_secs(1)).await;

        assert_eq!(h.transport.write_count("AA", 2), 1);
        let active = h.sink.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, ConditionKind::OutOfRange);
        assert_eq!(h.sink.presented_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_writes_back_in_range() {
        let h = harness(&[("AA", "Band-1", -90)]);
        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();
        wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| b.range == RangeState::OutOfRange)
        })
        .await;

        h.transport.set_rssi("AA", -50);
        wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| b.range == RangeState::InRange)
        })
        .await;

        assert_eq!(h.transport.write_count("AA", 3), 1);
        let active = h.sink.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, ConditionKind::BackInRange);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_connect_failure_removes_beacon() {
        let h = harness(&[("AA", "Band-1", -50)]);
        h.transport.fail_connects("AA", 1);
        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();

        for _ in 0..100 {
            if !h.sink.active().is_empty() {
                break;
            }
            settle(Duration::from_millis(10)).await;
        }
        let active = h.sink.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, ConditionKind::ConnectFailed);
        assert!(h.tracker.beacons().await.unwrap().is_empty());
        assert!(!h.transport.is_connected("AA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_reconnects_and_keeps_state() {
        let h = harness(&[("AA", "Band-1", -50)]);
        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();
        wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| b.distance_mm.is_some())
        })
        .await;
        h.tracker
            .set_label(BeaconId(0), Some("Nick".to_string()))
            .await
            .unwrap();

        h.transport.drop_link("AA");
        let statuses = wait_for_status(&h.tracker, |s| {
            s.first()
                .is_some_and(|b| b.reconnects == 1 && b.connection == ConnectionState::Ready)
        })
        .await;

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].id, BeaconId(0));
        assert_eq!(statuses[0].label.as_deref(), Some("Nick"));
        assert!(h.transport.is_connected("AA"));
        // The reconnect writes the default colour, not the team colour.
        assert_eq!(h.transport.write_count("AA", 1), 1);
        assert_eq!(h.transport.write_count("AA", 0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_state_survives_link_loss() {
        let h = harness(&[("AA", "Band-1", -90)]);
        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();
        wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| b.range == RangeState::OutOfRange)
        })
        .await;
        settle(Duration::from_secs(1)).await;
        assert_eq!(h.transport.write_count("AA", 2), 1);
        assert_eq!(h.sink.presented_count(), 1);
        let before = h.tracker.beacon(BeaconId(0)).await.unwrap().batches_completed;

        h.transport.drop_link("AA");
        wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| {
                b.reconnects == 1
                    && b.connection == ConnectionState::Ready
                    && b.batches_completed > before
            })
        })
        .await;
        settle(Duration::from_secs(1)).await;

        let status = h.tracker.beacon(BeaconId(0)).await.unwrap();
        assert_eq!(status.range, RangeState::OutOfRange);
        assert!(status.batches_completed > before);
        assert_eq!(h.transport.write_count("AA", 2), 1);
        assert_eq!(h.transport.write_count("AA", 0), 1);
        assert_eq!(h.sink.presented_count(), 1);
        let active = h.sink.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, ConditionKind::OutOfRange);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rescan_is_retried_after_backoff() {
        let h = harness(&[("AA", "Band-1", -50)]);
        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();
        wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| b.distance_mm.is_some())
        })
        .await;
        let scans = h.transport.scans_started();

        h.transport.fail_scans(1);
        h.transport.drop_link("AA");
        let statuses = wait_for_status(&h.tracker, |s| {
            s.first()
                .is_some_and(|b| b.reconnects == 1 && b.connection == ConnectionState::Ready)
        })
        .await;

        assert_eq!(statuses[0].id, BeaconId(0));
        assert!(h.transport.is_connected("AA"));
        assert_eq!(h.transport.scans_started(), scans + 1);
        assert!(!h.transport.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_kept_while_signal_strength_needs_it() {
        let h = harness(&[("AA", "Band-1", -50)]);
        h.transport.require_scan_for_rssi(true);
        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();
        wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| b.distance_mm.is_some())
        })
        .await;
        assert!(h.transport.is_scanning());

        h.tracker.stop_tracking(BeaconId(0)).await.unwrap();
        wait_for_status(&h.tracker, |s| !s[0].tracking).await;
        assert!(!h.transport.is_scanning());

        h.tracker.start_tracking(BeaconId(0)).await.unwrap();
        wait_for_status(&h.tracker, |s| s[0].tracking).await;
        assert!(h.transport.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_pairing_withdraws_earlier_connect_failure() {
        let h = harness(&[("AA", "Band-1", -50)]);
        h.transport.fail_connects("AA", 1);
        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();
        for _ in 0..100 {
            if !h.sink.active().is_empty() {
                break;
            }
            settle(Duration::from_millis(10)).await;
        }
        assert_eq!(h.sink.active()[0].kind, ConditionKind::ConnectFailed);

        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();
        let statuses = wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| b.connection == ConnectionState::Ready)
        })
        .await;

        assert_eq!(statuses[0].id, BeaconId(1));
        assert!(h.sink.active().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worn_transitions_raise_alerts() {
        let h = harness(&[("AA", "Band-1", -50)]);
        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();
        wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| b.distance_mm.is_some())
        })
        .await;

        assert!(h.transport.notify("AA", MOCK_IDENTIFY_CHARACTERISTIC, vec![0x01]));
        wait_for_status(&h.tracker, |s| s[0].worn == WornState::On).await;
        assert_eq!(h.sink.active()[0].kind, ConditionKind::BraceletOn);

        assert!(h.transport.notify("AA", MOCK_IDENTIFY_CHARACTERISTIC, vec![0x00]));
        wait_for_status(&h.tracker, |s| s[0].worn == WornState::Off).await;
        let active = h.sink.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, ConditionKind::BraceletRemoved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_require_connected_beacon() {
        let h = harness(&[("AA", "Band-1", -50)]);
        assert!(matches!(
            h.tracker.emergency(BeaconId(0), true).await,
            Err(TetherbandError::BeaconNotFound(_))
        ));
        assert_err!(h.tracker.set_label(BeaconId(0), Some("Nick".to_string())).await);

        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();
        wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| b.connection == ConnectionState::Ready)
        })
        .await;

        assert_ok!(h.tracker.emergency(BeaconId(0), true).await);
        assert_ok!(h.tracker.power_off(BeaconId(0)).await);
        settle(Duration::from_millis(50)).await;
        assert_eq!(h.transport.write_count("AA", 4), 1);
        assert_eq!(h.transport.write_count("AA", 6), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_tracking_halts_batches() {
        let h = harness(&[("AA", "Band-1", -50)]);
        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();
        wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| b.batches_completed >= 1)
        })
        .await;

        h.tracker.stop_tracking(BeaconId(0)).await.unwrap();
        let stopped = wait_for_status(&h.tracker, |s| !s[0].tracking).await;
        settle(Duration::from_secs(10)).await;
        let later = h.tracker.beacon(BeaconId(0)).await.unwrap();
        assert_eq!(later.batches_completed, stopped[0].batches_completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_tears_down_sessions() {
        let h = harness(&[("AA", "Band-1", -50), ("BB", "Band-2", -50)]);
        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();
        wait_for_status(&h.tracker, |s| {
            s.first().is_some_and(|b| b.connection == ConnectionState::Ready)
        })
        .await;
        h.tracker.pair(PairingRequest::fresh(pairing())).await.unwrap();
        let statuses = wait_for_status(&h.tracker, |s| {
            s.len() == 2 && s.iter().all(|b| b.connection == ConnectionState::Ready)
        })
        .await;
        assert_eq!(statuses[1].name, "Band-2");

        assert_eq!(h.tracker.disconnect_all().await.unwrap(), 2);
        assert!(h.tracker.beacons().await.unwrap().is_empty());
        assert!(!h.transport.is_connected("AA"));
        assert!(!h.transport.is_connected("BB"));
        assert!(h.sink.active().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_tracker() {
        let h = harness(&[]);
        h.tracker.shutdown().await.unwrap();
        h.task.await.unwrap();
        assert!(matches!(
            h.tracker.beacons().await,
            Err(TetherbandError::EngineUnavailable)
        ));
    }
}
