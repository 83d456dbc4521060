//! Scriptable in-memory transport.
//!
//! Peripherals are registered up front. Starting a scan advertises every
//! disconnected peripheral that offers the scanned service. Link loss,
//! notifications and failures are injected from the test.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{Transport, TransportError, TransportEvent, TransportEventSender, TransportResult};
use crate::gatt::{
    CharacteristicId, uuid_from_short, ALERT_LEVEL_CHARACTERISTIC, BATTERY_LEVEL_CHARACTERISTIC,
    BATTERY_SERVICE, IMMEDIATE_ALERT_SERVICE, LINK_LOSS_SERVICE, TX_POWER_LEVEL_CHARACTERISTIC,
    TX_POWER_SERVICE,
};
use crate::pairing::PairingIdentifier;
use crate::types::{Advertisement, PeripheralHandle};

/// Characteristic used by simulated bracelets on their identify service.
pub const MOCK_IDENTIFY_CHARACTERISTIC: Uuid = uuid_from_short(0xFFF1);

/// A simulated peripheral.
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    name: Option<String>,
    services: Vec<(Uuid, Vec<Uuid>)>,
    values: HashMap<Uuid, Vec<u8>>,
    rssi: i16,
    rssi_script: VecDeque<i16>,
    connected: bool,
    connect_failures: u32,
    rssi_failures: u32,
    rssi_delay: Duration,
    subscribed: HashSet<Uuid>,
}

impl MockPeripheral {
    /// A peripheral with a name and no services.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            services: Vec::new(),
            values: HashMap::new(),
            rssi: -60,
            rssi_script: VecDeque::new(),
            connected: false,
            connect_failures: 0,
            rssi_failures: 0,
            rssi_delay: Duration::ZERO,
            subscribed: HashSet::new(),
        }
    }

    /// A complete bracelet offering every tracked service.
    pub fn bracelet(name: impl Into<String>, pairing: &PairingIdentifier, tx_power: i8, rssi: i16) -> Self {
        Self::new(name)
            .with_service(IMMEDIATE_ALERT_SERVICE, vec![ALERT_LEVEL_CHARACTERISTIC])
            .with_service(TX_POWER_SERVICE, vec![TX_POWER_LEVEL_CHARACTERISTIC])
            .with_service(LINK_LOSS_SERVICE, vec![ALERT_LEVEL_CHARACTERISTIC])
            .with_service(BATTERY_SERVICE, vec![BATTERY_LEVEL_CHARACTERISTIC])
            .with_service(pairing.service_uuid(), vec![MOCK_IDENTIFY_CHARACTERISTIC])
            .with_value(TX_POWER_LEVEL_CHARACTERISTIC, vec![tx_power.to_le_bytes()[0]])
            .with_value(BATTERY_LEVEL_CHARACTERISTIC, vec![87])
            .with_rssi(rssi)
    }

    /// Add a service and its characteristics.
    #[must_use]
    pub fn with_service(mut self, service: Uuid, characteristics: Vec<Uuid>) -> Self {
        self.services.push((service, characteristics));
        self
    }

    /// Set the value returned when reading a characteristic.
    #[must_use]
    pub fn with_value(mut self, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.values.insert(characteristic, value);
        self
    }

    /// Remove a characteristic value so reads fail.
    #[must_use]
    pub fn without_value(mut self, characteristic: Uuid) -> Self {
        self.values.remove(&characteristic);
        self
    }

    /// Set the steady RSSI.
    #[must_use]
    pub const fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Advertise without a local name.
    #[must_use]
    pub fn unnamed(mut self) -> Self {
        self.name = None;
        self
    }
}

/// One recorded command write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockWrite {
    /// Characteristic written.
    pub characteristic: CharacteristicId,
    /// Byte written.
    pub value: u8,
    /// Whether a response was requested.
    pub reliable: bool,
}

#[derive(Debug, Default)]
struct MockState {
    peripherals: HashMap<PeripheralHandle, MockPeripheral>,
    writes: HashMap<PeripheralHandle, Vec<MockWrite>>,
    scanning: Option<PairingIdentifier>,
    scans_started: u32,
    scan_failures: u32,
    rssi_needs_scan: bool,
    disconnects: u32,
}

/// In-memory [`Transport`].
#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
    events: TransportEventSender,
}

impl MockTransport {
    /// Create a transport that reports events on `events`.
    #[must_use]
    pub fn new(events: TransportEventSender) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        // A closed channel means the engine is gone; nothing to report to.
        let _ = self.events.send(event);
    }

    /// Register a peripheral under a handle.
    pub fn add_peripheral(&self, handle: impl Into<String>, peripheral: MockPeripheral) {
        self.state()
            .peripherals
            .insert(PeripheralHandle::new(handle), peripheral);
    }

    /// Advertise one peripheral now, regardless of scan state.
    pub fn advertise(&self, handle: &str) {
        let advertisement = {
            let state = self.state();
            state
                .peripherals
                .get(&PeripheralHandle::new(handle))
                .map(|p| advertisement_for(&PeripheralHandle::new(handle), p))
        };
        if let Some(advertisement) = advertisement {
            self.emit(TransportEvent::Advertisement(advertisement));
        }
    }

    /// Set the steady RSSI of a peripheral and drop any scripted values.
    pub fn set_rssi(&self, handle: &str, rssi: i16) {
        if let Some(p) = self.state().peripherals.get_mut(&PeripheralHandle::new(handle)) {
            p.rssi = rssi;
            p.rssi_script.clear();
        }
    }

    /// Queue RSSI values returned before the steady value.
    pub fn script_rssi(&self, handle: &str, values: impl IntoIterator<Item = i16>) {
        if let Some(p) = self.state().peripherals.get_mut(&PeripheralHandle::new(handle)) {
            p.rssi_script.extend(values);
        }
    }

    /// Delay every RSSI read by `delay`.
    pub fn set_rssi_delay(&self, handle: &str, delay: Duration) {
        if let Some(p) = self.state().peripherals.get_mut(&PeripheralHandle::new(handle)) {
            p.rssi_delay = delay;
        }
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_connects(&self, handle: &str, count: u32) {
        if let Some(p) = self.state().peripherals.get_mut(&PeripheralHandle::new(handle)) {
            p.connect_failures = count;
        }
    }

    /// Make the next `count` scans fail to start.
    pub fn fail_scans(&self, count: u32) {
        self.state().scan_failures = count;
    }

    /// Report RSSI as current only while scanning, like BlueZ.
    pub fn require_scan_for_rssi(&self, required: bool) {
        self.state().rssi_needs_scan = required;
    }

    /// Make the next `count` RSSI reads fail.
    pub fn fail_rssi_reads(&self, handle: &str, count: u32) {
        if let Some(p) = self.state().peripherals.get_mut(&PeripheralHandle::new(handle)) {
            p.rssi_failures = count;
        }
    }

    /// Drop the link and report it.
    pub fn drop_link(&self, handle: &str) {
        let handle = PeripheralHandle::new(handle);
        let was_connected = self
            .state()
            .peripherals
            .get_mut(&handle)
            .is_some_and(|p| std::mem::replace(&mut p.connected, false));
        if was_connected {
            self.emit(TransportEvent::Disconnected {
                handle,
                reason: Some("link lost".to_string()),
            });
        }
    }

    /// Push a notification from a subscribed characteristic.
    ///
    /// Returns `false` if the characteristic is unknown or not subscribed.
    pub fn notify(&self, handle: &str, characteristic: Uuid, payload: Vec<u8>) -> bool {
        let handle = PeripheralHandle::new(handle);
        let id = {
            let state = self.state();
            let Some(p) = state.peripherals.get(&handle) else {
                return false;
            };
            if !p.subscribed.contains(&characteristic) {
                return false;
            }
            p.services
                .iter()
                .find(|(_, chars)| chars.contains(&characteristic))
                .map(|(service, _)| CharacteristicId::new(*service, characteristic))
        };
        match id {
            Some(characteristic) => {
                self.emit(TransportEvent::Notification {
                    handle,
                    characteristic,
                    payload,
                });
                true
            }
            None => false,
        }
    }

    /// Command writes made to a peripheral, in order.
    #[must_use]
    pub fn writes(&self, handle: &str) -> Vec<MockWrite> {
        self.state()
            .writes
            .get(&PeripheralHandle::new(handle))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of writes of one byte value to a peripheral.
    #[must_use]
    pub fn write_count(&self, handle: &str, value: u8) -> usize {
        self.writes(handle).iter().filter(|w| w.value == value).count()
    }

    /// Whether a peripheral is connected.
    #[must_use]
    pub fn is_connected(&self, handle: &str) -> bool {
        self.state()
            .peripherals
            .get(&PeripheralHandle::new(handle))
            .is_some_and(|p| p.connected)
    }

    /// Whether a scan is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.state().scanning.is_some()
    }

    /// Number of scans started.
    #[must_use]
    pub fn scans_started(&self) -> u32 {
        self.state().scans_started
    }

    /// Number of explicit disconnects.
    #[must_use]
    pub fn disconnects(&self) -> u32 {
        self.state().disconnects
    }

    fn with_connected<T>(
        &self,
        handle: &PeripheralHandle,
        f: impl FnOnce(&mut MockPeripheral) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let mut state = self.state();
        let peripheral = state
            .peripherals
            .get_mut(handle)
            .ok_or_else(|| TransportError::UnknownPeripheral(handle.clone()))?;
        if !peripheral.connected {
            return Err(TransportError::NotConnected(handle.clone()));
        }
        f(peripheral)
    }
}

fn advertisement_for(handle: &PeripheralHandle, peripheral: &MockPeripheral) -> Advertisement {
    Advertisement {
        handle: handle.clone(),
        local_name: peripheral.name.clone(),
        rssi: Some(peripheral.rssi),
        manufacturer_data: None,
    }
}

fn find_characteristic(peripheral: &MockPeripheral, id: &CharacteristicId) -> TransportResult<()> {
    let (_, characteristics) = peripheral
        .services
        .iter()
        .find(|(service, _)| *service == id.service)
        .ok_or(TransportError::ServiceNotFound(id.service))?;
    if characteristics.contains(&id.characteristic) {
        Ok(())
    } else {
        Err(TransportError::CharacteristicNotFound(id.characteristic))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn scan(&self, pairing: &PairingIdentifier) -> TransportResult<()> {
        let service = pairing.service_uuid();
        let sightings: Vec<Advertisement> = {
            let mut state = self.state();
            if state.scan_failures > 0 {
                state.scan_failures -= 1;
                return Err(TransportError::ScanFailed("simulated failure".to_string()));
            }
            state.scanning = Some(pairing.clone());
            state.scans_started += 1;
            let mut sightings: Vec<Advertisement> = state
                .peripherals
                .iter()
                .filter(|(_, p)| !p.connected && p.services.iter().any(|(s, _)| *s == service))
                .map(|(handle, p)| advertisement_for(handle, p))
                .collect();
            sightings.sort_by(|a, b| a.handle.as_str().cmp(b.handle.as_str()));
            sightings
        };
        for advertisement in sightings {
            self.emit(TransportEvent::Advertisement(advertisement));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.state().scanning = None;
        Ok(())
    }

    async fn connect(&self, handle: &PeripheralHandle) -> TransportResult<()> {
        let mut state = self.state();
        let peripheral = state
            .peripherals
            .get_mut(handle)
            .ok_or_else(|| TransportError::UnknownPeripheral(handle.clone()))?;
        if peripheral.connect_failures > 0 {
            peripheral.connect_failures -= 1;
            return Err(TransportError::ConnectFailed {
                handle: handle.clone(),
                reason: "simulated failure".to_string(),
            });
        }
        peripheral.connected = true;
        Ok(())
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> TransportResult<()> {
        let mut state = self.state();
        if let Some(peripheral) = state.peripherals.get_mut(handle) {
            peripheral.connected = false;
            peripheral.subscribed.clear();
        }
        state.disconnects += 1;
        Ok(())
    }

    async fn discover_services(
        &self,
        handle: &PeripheralHandle,
        services: &[Uuid],
    ) -> TransportResult<Vec<Uuid>> {
        self.with_connected(handle, |p| {
            Ok(p.services
                .iter()
                .map(|(service, _)| *service)
                .filter(|service| services.contains(service))
                .collect())
        })
    }

    async fn discover_characteristics(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
    ) -> TransportResult<Vec<Uuid>> {
        self.with_connected(handle, |p| {
            p.services
                .iter()
                .find(|(s, _)| *s == service)
                .map(|(_, chars)| chars.clone())
                .ok_or(TransportError::ServiceNotFound(service))
        })
    }

    async fn read_value(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
    ) -> TransportResult<Vec<u8>> {
        self.with_connected(handle, |p| {
            find_characteristic(p, characteristic)?;
            p.values
                .get(&characteristic.characteristic)
                .cloned()
                .ok_or_else(|| TransportError::ReadFailed {
                    characteristic: characteristic.characteristic,
                    reason: "not readable".to_string(),
                })
        })
    }

    async fn write_value(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
        value: u8,
        reliable: bool,
    ) -> TransportResult<()> {
        self.with_connected(handle, |p| find_characteristic(p, characteristic))?;
        self.state()
            .writes
            .entry(handle.clone())
            .or_default()
            .push(MockWrite {
                characteristic: *characteristic,
                value,
                reliable,
            });
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
    ) -> TransportResult<()> {
        self.with_connected(handle, |p| {
            find_characteristic(p, characteristic)?;
            p.subscribed.insert(characteristic.characteristic);
            Ok(())
        })
    }

    async fn read_signal_strength(&self, handle: &PeripheralHandle) -> TransportResult<i16> {
        let (delay, result) = self.with_connected(handle, |p| {
            let result = if p.rssi_failures > 0 {
                p.rssi_failures -= 1;
                Err(TransportError::Backend("simulated RSSI read failure".to_string()))
            } else {
                Ok(p.rssi_script.pop_front().unwrap_or(p.rssi))
            };
            Ok((p.rssi_delay, result))
        })?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }

    fn signal_strength_needs_scan(&self) -> bool {
        self.state().rssi_needs_scan
    }
}
