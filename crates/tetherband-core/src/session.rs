//! Per-beacon session actor.
//!
//! Each beacon runs in its own task. The task owns the connection lifecycle,
//! the characteristic handles, the sampler and both state machines; nothing
//! else mutates them. Inputs arrive as [`SessionCommand`]s, outputs leave as
//! [`SessionEvent`]s that the tracker applies to the registry.
//!
//! Lifecycle:
//!
//! ```text
//! Discovered -> Connecting -> DiscoveringServices -> DiscoveringCharacteristics -> Ready
//!                   ^                                                              |
//!                   +---------------------- Reconnecting <------- link lost -------+
//! ```
//!
//! A failed connect before the first `Ready` ends the session. After that,
//! failures park the session in `Reconnecting` and ask for a rescan.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CommandBytes, Config};
use crate::filter::ProximityFilter;
use crate::gatt::{classify_service, tracked_services, CharacteristicHandles, CharacteristicId, GattRole};
use crate::pairing::PairingRequest;
use crate::range::{RangeEvent, RangeStateMachine};
use crate::sampling::{BatchOutcome, SamplingSession};
use crate::transport::{Transport, TransportResult};
use crate::types::{BeaconId, ConnectionState, PeripheralHandle, RangeState, WornState};
use crate::worn::{WornEvent, WornStateMachine};

/// Capacity of a session's command queue.
pub const SESSION_COMMAND_CAPACITY: usize = 32;

/// Input to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// The beacon was sighted at `handle`; connect if not connected.
    Attach(PeripheralHandle),
    /// The transport reported link loss.
    LinkLost(Option<String>),
    /// A subscribed characteristic notified.
    Notification {
        /// Characteristic that notified.
        characteristic: CharacteristicId,
        /// Raw value.
        payload: Vec<u8>,
    },
    /// Begin periodic sampling.
    StartTracking,
    /// Stop periodic sampling.
    StopTracking,
    /// Start (`true`) or stop (`false`) the emergency pattern.
    Emergency(bool),
    /// Power the bracelet off.
    PowerOff,
}

/// Output of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    /// Beacon that produced the event.
    pub beacon: BeaconId,
    /// What happened.
    pub kind: SessionEventKind,
}

/// What a session reports.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    /// Connection state changed.
    Connection {
        /// New state.
        state: ConnectionState,
        /// Link re-establishments so far.
        reconnects: u32,
    },
    /// The first connection attempt failed; the session has ended.
    ConnectFailed {
        /// Failure description.
        reason: String,
    },
    /// Transmit power read at connect (`None` when the fallback is in use).
    TxPower(Option<i8>),
    /// Battery percentage.
    Battery(u8),
    /// A batch produced a distance.
    Distance {
        /// Estimated distance in millimetres.
        distance_mm: f64,
        /// Range classification after this reading.
        range: RangeState,
        /// Transition fired by this reading, if any.
        transition: Option<RangeEvent>,
        /// Batches completed so far.
        batches_completed: u64,
    },
    /// Worn state changed.
    Worn {
        /// New state.
        state: WornState,
        /// The transition.
        transition: WornEvent,
    },
    /// Sampling was switched on or off.
    Tracking(bool),
    /// The session is waiting to re-sight its beacon.
    RescanRequested,
}

/// Everything a session needs besides its beacon.
#[derive(Clone)]
pub struct SessionContext {
    /// Deployment configuration.
    pub config: Arc<Config>,
    /// Radio.
    pub transport: Arc<dyn Transport>,
    /// Where session events go.
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Control handle for a running session.
pub struct SessionHandle {
    beacon: BeaconId,
    commands: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
    task: JoinHandle<Option<PeripheralHandle>>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("beacon", &self.beacon)
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Beacon this session serves.
    #[must_use]
    pub const fn beacon(&self) -> BeaconId {
        self.beacon
    }

    /// Queue a command. Returns `false` if the session has ended.
    pub async fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    /// Whether the session task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the session: cancel it, wait for the task (which abandons any
    /// in-flight batch), then tear down the link.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        match self.task.await {
            Ok(Some(handle)) => {
                if let Err(e) = self.transport.disconnect(&handle).await {
                    warn!(beacon = %self.beacon, %handle, error = %e, "Disconnect failed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(beacon = %self.beacon, error = %e, "Session task panicked"),
        }
    }
}

/// Flow control after handling one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// One beacon's session state. Lives inside its task.
pub struct BeaconSession {
    beacon: BeaconId,
    name: String,
    request: PairingRequest,
    handle: Option<PeripheralHandle>,
    state: ConnectionState,
    ever_ready: bool,
    reconnects: u32,
    characteristics: CharacteristicHandles,
    sampler: SamplingSession,
    filter: ProximityFilter,
    range: RangeStateMachine,
    worn: WornStateMachine,
    tracking: bool,
    batches_completed: u64,
    next_batch: Option<Instant>,
    max_distance_mm: f64,
    in_range_interval: Duration,
    reconnect_backoff: Duration,
    commands: CommandBytes,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
}

impl BeaconSession {
    /// Spawn a session for a beacon first sighted at `handle`.
    pub fn spawn(
        beacon: BeaconId,
        name: impl Into<String>,
        request: PairingRequest,
        handle: PeripheralHandle,
        context: SessionContext,
    ) -> SessionHandle {
        let tracking_config = &context.config.tracking;
        let cancel = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::channel(SESSION_COMMAND_CAPACITY);

        let session = Self {
            beacon,
            name: name.into(),
            request,
            handle: Some(handle),
            state: ConnectionState::Discovered,
            ever_ready: false,
            reconnects: 0,
            characteristics: CharacteristicHandles::default(),
            sampler: SamplingSession::new(tracking_config),
            filter: ProximityFilter::new(tracking_config.path_loss_exponent),
            range: RangeStateMachine::new(tracking_config.out_of_range_debounce),
            worn: WornStateMachine::new(context.config.sensor),
            tracking: tracking_config.auto_start,
            batches_completed: 0,
            next_batch: None,
            max_distance_mm: tracking_config.max_distance_mm,
            in_range_interval: tracking_config.in_range_interval(),
            reconnect_backoff: tracking_config.reconnect_backoff(),
            commands: context.config.commands,
            transport: context.transport.clone(),
            events: context.events,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(session.run(command_rx));

        SessionHandle {
            beacon,
            commands: command_tx,
            cancel,
            task,
            transport: context.transport,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) -> Option<PeripheralHandle> {
        info!(beacon = %self.beacon, name = %self.name, "Session started");

        if let Some(handle) = self.handle.clone() {
            if self.connect(handle).await == Flow::Exit {
                return None;
            }
        }

        loop {
            let due = self.next_batch;
            let batch_due = async move {
                match due {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if self.handle_command(command).await == Flow::Exit {
                        return None;
                    }
                }
                () = batch_due => self.run_batch().await,
            }
        }

        info!(beacon = %self.beacon, "Session stopped");
        self.handle.take()
    }

    fn emit(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            beacon: self.beacon,
            kind,
        };
        if self.events.send(event).is_err() {
            debug!(beacon = %self.beacon, "Tracker gone; dropping session event");
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(beacon = %self.beacon, from = ?self.state, to = ?state, "Connection state");
        self.state = state;
        self.emit(SessionEventKind::Connection {
            state,
            reconnects: self.reconnects,
        });
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Attach(handle) => {
                if matches!(
                    self.state,
                    ConnectionState::Reconnecting | ConnectionState::Discovered
                ) {
                    return self.connect(handle).await;
                }
                debug!(beacon = %self.beacon, state = ?self.state, "Ignoring sighting while connected");
            }
            SessionCommand::LinkLost(reason) => self.link_lost(reason),
            SessionCommand::Notification {
                characteristic,
                payload,
            } => self.notification(&characteristic, &payload),
            SessionCommand::StartTracking => {
                self.tracking = true;
                if self.state.is_ready() && self.next_batch.is_none() {
                    self.next_batch = Some(Instant::now());
                }
                self.emit(SessionEventKind::Tracking(true));
            }
            SessionCommand::StopTracking => {
                self.tracking = false;
                self.next_batch = None;
                self.emit(SessionEventKind::Tracking(false));
            }
            SessionCommand::Emergency(active) => {
                let byte = if active {
                    self.commands.emergency_start
                } else {
                    self.commands.emergency_stop
                };
                self.write_command(byte, "emergency").await;
            }
            SessionCommand::PowerOff => {
                self.write_command(self.commands.power_off, "power off").await;
            }
        }
        Flow::Continue
    }

    /// Connect and set up, or handle the failure.
    async fn connect(&mut self, handle: PeripheralHandle) -> Flow {
        self.handle = Some(handle.clone());
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Flow::Continue,
            result = self.establish(&handle) => result,
        };

        let Err(e) = result else {
            return Flow::Continue;
        };

        if let Err(disconnect_error) = self.transport.disconnect(&handle).await {
            debug!(beacon = %self.beacon, error = %disconnect_error, "Cleanup disconnect failed");
        }
        self.characteristics = CharacteristicHandles::default();
        self.handle = None;

        if !self.ever_ready {
            warn!(beacon = %self.beacon, %handle, error = %e, "First connection failed");
            self.emit(SessionEventKind::ConnectFailed {
                reason: e.to_string(),
            });
            return Flow::Exit;
        }

        warn!(beacon = %self.beacon, %handle, error = %e, "Reconnect failed; retrying after backoff");
        self.set_state(ConnectionState::Reconnecting);
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Flow::Continue,
            () = tokio::time::sleep(self.reconnect_backoff) => {}
        }
        self.emit(SessionEventKind::RescanRequested);
        Flow::Continue
    }

    async fn establish(&mut self, handle: &PeripheralHandle) -> TransportResult<()> {
        self.set_state(ConnectionState::Connecting);
        self.transport.connect(handle).await?;

        self.set_state(ConnectionState::DiscoveringServices);
        let services = self
            .transport
            .discover_services(handle, &tracked_services(&self.request.identifier))
            .await?;

        self.set_state(ConnectionState::DiscoveringCharacteristics);
        let mut characteristics = CharacteristicHandles::default();
        for service in services {
            let Some(role) = classify_service(&service, &self.request.identifier) else {
                continue;
            };
            let found = self.transport.discover_characteristics(handle, service).await?;
            if characteristics.assign(role, service, &found).is_none() {
                warn!(beacon = %self.beacon, ?role, %service, "Service has no characteristics");
            }
        }
        self.characteristics = characteristics;

        self.read_tx_power(handle).await;
        self.setup_battery(handle).await;
        if let Some(identify) = self.characteristics.identify {
            if let Err(e) = self.transport.subscribe_notifications(handle, &identify).await {
                warn!(beacon = %self.beacon, error = %e, "Capacitive sense subscription failed");
            }
        } else {
            warn!(beacon = %self.beacon, "No identify characteristic; commands and worn state unavailable");
        }

        let reconnected = self.ever_ready;
        if reconnected {
            self.reconnects += 1;
        }
        self.set_state(ConnectionState::Ready);
        info!(beacon = %self.beacon, %handle, reconnected, "Beacon ready");

        let connected = if self.request.reconnect || reconnected {
            self.commands.connected_default
        } else {
            self.commands.connected_team_color
        };
        self.ever_ready = true;
        self.write_command(connected, "connected").await;

        if self.tracking {
            self.next_batch = Some(Instant::now());
            if !reconnected {
                self.emit(SessionEventKind::Tracking(true));
            }
        }
        Ok(())
    }

    async fn read_tx_power(&mut self, handle: &PeripheralHandle) {
        let reported = match self.characteristics.tx_power {
            Some(characteristic) => match self.transport.read_value(handle, &characteristic).await {
                Ok(value) => value.first().map(|byte| i8::from_le_bytes([*byte])),
                Err(e) => {
                    warn!(beacon = %self.beacon, error = %e, "Tx power read failed");
                    None
                }
            },
            None => None,
        };
        match reported {
            Some(tx_power) => self.sampler.set_tx_power(tx_power),
            None => info!(
                beacon = %self.beacon,
                fallback = self.sampler.effective_tx_power(),
                "Using fallback tx power"
            ),
        }
        self.emit(SessionEventKind::TxPower(self.sampler.tx_power()));
    }

    async fn setup_battery(&mut self, handle: &PeripheralHandle) {
        let Some(battery) = self.characteristics.battery else {
            return;
        };
        if let Err(e) = self.transport.subscribe_notifications(handle, &battery).await {
            warn!(beacon = %self.beacon, error = %e, "Battery subscription failed");
        }
        match self.transport.read_value(handle, &battery).await {
            Ok(value) => self.battery_value(&value),
            Err(e) => warn!(beacon = %self.beacon, error = %e, "Battery read failed"),
        }
    }

    fn battery_value(&self, payload: &[u8]) {
        match payload.first() {
            Some(level) => {
                debug!(beacon = %self.beacon, level, "Battery level");
                self.emit(SessionEventKind::Battery(*level));
            }
            None => warn!(beacon = %self.beacon, "Empty battery payload"),
        }
    }

    fn link_lost(&mut self, reason: Option<String>) {
        if matches!(self.state, ConnectionState::Reconnecting) {
            return;
        }
        warn!(beacon = %self.beacon, reason = reason.as_deref().unwrap_or("unknown"), "Link lost");
        self.characteristics = CharacteristicHandles::default();
        self.handle = None;
        self.next_batch = None;
        self.set_state(ConnectionState::Reconnecting);
        self.emit(SessionEventKind::RescanRequested);
    }

    fn notification(&mut self, characteristic: &CharacteristicId, payload: &[u8]) {
        match self.characteristics.role_of(characteristic) {
            Some(GattRole::Identify) => match self.worn.apply(payload) {
                Ok(Some(transition)) => {
                    info!(beacon = %self.beacon, ?transition, "Worn state changed");
                    self.emit(SessionEventKind::Worn {
                        state: self.worn.state(),
                        transition,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(beacon = %self.beacon, error = %e, "Discarding capacitive sense payload"),
            },
            Some(GattRole::Battery) => self.battery_value(payload),
            _ => debug!(
                beacon = %self.beacon,
                characteristic = %characteristic.characteristic,
                "Ignoring notification"
            ),
        }
    }

    async fn write_command(&self, byte: u8, what: &str) {
        let (Some(handle), Some(identify)) = (self.handle.as_ref(), self.characteristics.identify)
        else {
            warn!(beacon = %self.beacon, command = what, "Beacon not ready; command dropped");
            return;
        };
        match self.transport.write_value(handle, &identify, byte, true).await {
            Ok(()) => debug!(beacon = %self.beacon, command = what, byte, "Command written"),
            Err(e) => warn!(beacon = %self.beacon, command = what, error = %e, "Command write failed"),
        }
    }

    async fn run_batch(&mut self) {
        self.next_batch = None;
        let Some(handle) = self.handle.clone() else {
            return;
        };
        if !self.tracking || !self.state.is_ready() {
            return;
        }

        let outcome = self
            .sampler
            .collect(self.transport.as_ref(), &handle, &self.cancel)
            .await;
        match &outcome {
            BatchOutcome::Cancelled => return,
            BatchOutcome::Aborted(e) => {
                debug!(beacon = %self.beacon, error = %e, "Batch aborted");
            }
            BatchOutcome::Complete(_) | BatchOutcome::WatchdogExpired(_) => {}
        }

        if let Some(distance_mm) = self.sampler.estimate(&self.filter, &outcome) {
            self.batches_completed += 1;
            let transition = self.range.observe(distance_mm, self.max_distance_mm);
            debug!(
                beacon = %self.beacon,
                distance_mm,
                range = ?self.range.state(),
                "Distance estimate"
            );
            match transition {
                Some(RangeEvent::OutOfRangeConfirmed { entered: true }) => {
                    info!(beacon = %self.beacon, distance_mm, "Out of range");
                    self.write_command(self.commands.out_of_range, "out of range").await;
                }
                Some(RangeEvent::Recovered) => {
                    info!(beacon = %self.beacon, distance_mm, "Back in range");
                    self.write_command(self.commands.back_in_range, "back in range").await;
                }
                Some(RangeEvent::OutOfRangeConfirmed { entered: false }) | None => {}
            }
            self.emit(SessionEventKind::Distance {
                distance_mm,
                range: self.range.state(),
                transition,
                batches_completed: self.batches_completed,
            });
        }

        if self.tracking && self.state.is_ready() {
            self.next_batch = Some(match self.range.state() {
                RangeState::InRange => Instant::now() + self.in_range_interval,
                RangeState::OutOfRange => Instant::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::PairingIdentifier;
    use crate::transport::event_channel;
    use crate::transport::mock::{MockPeripheral, MockTransport};

    fn pairing() -> PairingIdentifier {
        PairingIdentifier::new("180A").unwrap()
    }

    fn context(
        transport: Arc<MockTransport>,
    ) -> (SessionContext, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let context = SessionContext {
            config: Arc::new(Config::default()),
            transport,
            events,
        };
        (context, rx)
    }

    fn mock() -> Arc<MockTransport> {
        let (tx, _rx) = event_channel();
        let transport = Arc::new(MockTransport::new(tx));
        transport.add_peripheral("AA", MockPeripheral::bracelet("Band-1", &pairing(), -12, -50));
        transport
    }

    async fn next_matching(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        mut pred: impl FnMut(&SessionEventKind) -> bool,
    ) -> SessionEventKind {
        loop {
            let event = rx.recv().await.expect("session event");
            if pred(&event.kind) {
                return event.kind;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_pairing_writes_team_colour_and_samples() {
        let transport = mock();
        let (context, mut rx) = context(transport.clone());
        let session = BeaconSession::spawn(
            BeaconId(0),
            "Band-1",
            PairingRequest::fresh(pairing()),
            PeripheralHandle::new("AA"),
            context,
        );

        let tx = next_matching(&mut rx, |k| matches!(k, SessionEventKind::TxPower(_))).await;
        assert_eq!(tx, SessionEventKind::TxPower(Some(-12)));
        let battery = next_matching(&mut rx, |k| matches!(k, SessionEventKind::Battery(_))).await;
        assert_eq!(battery, SessionEventKind::Battery(87));

        match next_matching(&mut rx, |k| matches!(k, SessionEventKind::Distance { .. })).await {
            SessionEventKind::Distance {
                distance_mm,
                range,
                transition,
                batches_completed,
            } => {
                assert!((distance_mm - 79.43).abs() < 0.01);
                assert_eq!(range, RangeState::InRange);
                assert_eq!(transition, None);
                assert_eq!(batches_completed, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(transport.write_count("AA", 1), 1);

        session.shutdown().await;
        assert!(!transport.is_connected("AA"));
    }

    fn batches_of(kind: &SessionEventKind) -> Option<u64> {
        match kind {
            SessionEventKind::Distance {
                batches_completed, ..
            } => Some(*batches_completed),
            _ => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_range_batches_wait_for_interval() {
        let config = Config::default();
        let interval = config.tracking.in_range_interval();
        let transport = mock();
        let (context, mut rx) = context(transport.clone());
        let session = BeaconSession::spawn(
            BeaconId(0),
            "Band-1",
            PairingRequest::fresh(pairing()),
            PeripheralHandle::new("AA"),
            context,
        );

        let first = next_matching(&mut rx, |k| batches_of(k).is_some()).await;
        assert_eq!(batches_of(&first), Some(1));
        let first_at = Instant::now();

        tokio::time::sleep_until(first_at + interval - Duration::from_millis(1)).await;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(batches_of(&event.kind), None, "batch ran before the interval");
        }

        let second = next_matching(&mut rx, |k| batches_of(k).is_some()).await;
        assert_eq!(batches_of(&second), Some(2));
        let elapsed = Instant::now() - first_at;
        assert!(elapsed >= interval);
        assert!(elapsed <= interval + config.tracking.sample_window());
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_batches_run_back_to_back() {
        let config = Config::default();
        let transport = mock();
        transport.set_rssi("AA", -90);
        let (context, mut rx) = context(transport.clone());
        let session = BeaconSession::spawn(
            BeaconId(0),
            "Band-1",
            PairingRequest::fresh(pairing()),
            PeripheralHandle::new("AA"),
            context,
        );

        let confirmed = next_matching(&mut rx, |k| {
            matches!(k, SessionEventKind::Distance { range: RangeState::OutOfRange, .. })
        })
        .await;
        let start = batches_of(&confirmed).unwrap_or_default();
        let confirmed_at = Instant::now();

        next_matching(&mut rx, |k| batches_of(k) == Some(start + 4)).await;
        assert!(Instant::now() - confirmed_at <= config.tracking.sample_window() * 4);
        assert_eq!(transport.write_count("AA", 2), 1);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_tag_writes_default_colour() {
        let transport = mock();
        let (context, mut rx) = context(transport.clone());
        let session = BeaconSession::spawn(
            BeaconId(0),
            "Band-1",
            PairingRequest::reconnect(pairing()),
            PeripheralHandle::new("AA"),
            context,
        );
        next_matching(&mut rx, |k| matches!(k, SessionEventKind::Distance { .. })).await;
        assert_eq!(transport.write_count("AA", 0), 1);
        assert_eq!(transport.write_count("AA", 1), 0);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_connect_failure_ends_session() {
        let transport = mock();
        transport.fail_connects("AA", 1);
        let (context, mut rx) = context(transport.clone());
        let session = BeaconSession::spawn(
            BeaconId(3),
            "Band-1",
            PairingRequest::fresh(pairing()),
            PeripheralHandle::new("AA"),
            context,
        );

        let failed =
            next_matching(&mut rx, |k| matches!(k, SessionEventKind::ConnectFailed { .. })).await;
        assert!(matches!(failed, SessionEventKind::ConnectFailed { .. }));
        session.shutdown().await;
        assert!(!transport.is_connected("AA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_requests_rescan_and_reattaches() {
        let transport = mock();
        let (context, mut rx) = context(transport.clone());
        let session = BeaconSession::spawn(
            BeaconId(0),
            "Band-1",
            PairingRequest::fresh(pairing()),
            PeripheralHandle::new("AA"),
            context,
        );
        next_matching(&mut rx, |k| matches!(k, SessionEventKind::Distance { .. })).await;

        transport.drop_link("AA");
        assert!(session.send(SessionCommand::LinkLost(None)).await);
        next_matching(&mut rx, |k| matches!(k, SessionEventKind::RescanRequested)).await;

        assert!(session.send(SessionCommand::Attach(PeripheralHandle::new("AA"))).await);
        let ready = next_matching(&mut rx, |k| {
            matches!(k, SessionEventKind::Connection { state: ConnectionState::Ready, .. })
        })
        .await;
        assert_eq!(
            ready,
            SessionEventKind::Connection {
                state: ConnectionState::Ready,
                reconnects: 1
            }
        );
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_worn_notifications_fire_on_change_only() {
        let transport = mock();
        let (context, mut rx) = context(transport.clone());
        let session = BeaconSession::spawn(
            BeaconId(0),
            "Band-1",
            PairingRequest::fresh(pairing()),
            PeripheralHandle::new("AA"),
            context,
        );
        next_matching(&mut rx, |k| {
            matches!(k, SessionEventKind::Connection { state: ConnectionState::Ready, .. })
        })
        .await;

        let identify = CharacteristicId::new(
            pairing().service_uuid(),
            crate::transport::mock::MOCK_IDENTIFY_CHARACTERISTIC,
        );
        for payload in [vec![0x01], vec![0x01], vec![0x00]] {
            session
                .send(SessionCommand::Notification {
                    characteristic: identify,
                    payload,
                })
                .await;
        }

        let on = next_matching(&mut rx, |k| matches!(k, SessionEventKind::Worn { .. })).await;
        assert_eq!(
            on,
            SessionEventKind::Worn {
                state: WornState::On,
                transition: WornEvent::PutOn
            }
        );
        let off = next_matching(&mut rx, |k| matches!(k, SessionEventKind::Worn { .. })).await;
        assert_eq!(
            off,
            SessionEventKind::Worn {
                state: WornState::Off,
                transition: WornEvent::Removed
            }
        );
        session.shutdown().await;
    }
}
