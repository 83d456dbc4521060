//! BlueZ transport over D-Bus.
//!
//! Handles are device addresses (`AA:BB:CC:DD:EE:FF`). BlueZ does not expose
//! an on-demand RSSI read for connected LE links, so
//! [`Transport::read_signal_strength`] returns the RSSI property that
//! `bluetoothd` keeps current while discovery runs. The transport reports
//! this through [`Transport::signal_strength_needs_scan`], and the tracker
//! keeps discovery running while any beacon is tracked.
//!
//! Every pairing service scanned for since the last [`Transport::stop_scan`]
//! stays in the discovery filter, so one discovery session serves all
//! tracked beacons.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest, Service};
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport, Session,
};
use futures::{pin_mut, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Transport, TransportError, TransportEvent, TransportEventSender, TransportResult};
use crate::gatt::CharacteristicId;
use crate::pairing::PairingIdentifier;
use crate::types::{Advertisement, ManufacturerData, PeripheralHandle};

const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);
const SERVICES_RESOLVE_ATTEMPTS: u32 = 50;

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            bluer::ErrorKind::NotReady => Self::AdapterPoweredOff,
            bluer::ErrorKind::NotFound => Self::Backend(format!("not found: {}", err.message)),
            _ => Self::Backend(err.to_string()),
        }
    }
}

#[derive(Default)]
struct Tasks {
    discovery: Option<JoinHandle<()>>,
    filter_uuids: HashSet<Uuid>,
    per_device: HashMap<PeripheralHandle, Vec<JoinHandle<()>>>,
}

/// [`Transport`] backed by the system's default BlueZ adapter.
pub struct BluezTransport {
    _session: Session,
    adapter: Adapter,
    events: TransportEventSender,
    tasks: Mutex<Tasks>,
}

impl std::fmt::Debug for BluezTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluezTransport")
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

impl BluezTransport {
    /// Connect to `bluetoothd` and open the default adapter.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AdapterUnavailable`] if no adapter exists and
    /// [`TransportError::AdapterPoweredOff`] if it cannot be powered on.
    pub async fn new(events: TransportEventSender) -> TransportResult<Self> {
        let session = Session::new().await?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| TransportError::AdapterUnavailable)?;
        if !adapter.is_powered().await? {
            adapter
                .set_powered(true)
                .await
                .map_err(|_| TransportError::AdapterPoweredOff)?;
        }
        info!(adapter = %adapter.name(), address = %adapter.address().await?, "Bluetooth adapter ready");

        Ok(Self {
            _session: session,
            adapter,
            events,
            tasks: Mutex::new(Tasks::default()),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self, handle: &PeripheralHandle) -> TransportResult<Device> {
        let address: Address = handle
            .as_str()
            .parse()
            .map_err(|_| TransportError::UnknownPeripheral(handle.clone()))?;
        self.adapter
            .device(address)
            .map_err(|_| TransportError::UnknownPeripheral(handle.clone()))
    }

    async fn connected_device(&self, handle: &PeripheralHandle) -> TransportResult<Device> {
        let device = self.device(handle)?;
        if !device.is_connected().await? {
            return Err(TransportError::NotConnected(handle.clone()));
        }
        Ok(device)
    }

    async fn service(&self, device: &Device, uuid: Uuid) -> TransportResult<Service> {
        for service in device.services().await? {
            if service.uuid().await? == uuid {
                return Ok(service);
            }
        }
        Err(TransportError::ServiceNotFound(uuid))
    }

    async fn characteristic(
        &self,
        handle: &PeripheralHandle,
        id: &CharacteristicId,
    ) -> TransportResult<Characteristic> {
        let device = self.connected_device(handle).await?;
        let service = self.service(&device, id.service).await?;
        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == id.characteristic {
                return Ok(characteristic);
            }
        }
        Err(TransportError::CharacteristicNotFound(id.characteristic))
    }

    async fn wait_services_resolved(&self, device: &Device) -> TransportResult<()> {
        for _ in 0..SERVICES_RESOLVE_ATTEMPTS {
            if device.is_services_resolved().await? {
                return Ok(());
            }
            tokio::time::sleep(SERVICES_RESOLVE_POLL).await;
        }
        Err(TransportError::Backend(format!(
            "services of {} were not resolved",
            device.address()
        )))
    }

    fn track_task(&self, handle: &PeripheralHandle, task: JoinHandle<()>) {
        self.tasks()
            .per_device
            .entry(handle.clone())
            .or_default()
            .push(task);
    }

    fn abort_device_tasks(&self, handle: &PeripheralHandle) {
        if let Some(tasks) = self.tasks().per_device.remove(handle) {
            for task in tasks {
                task.abort();
            }
        }
    }
}

async fn advertisement(device: &Device) -> TransportResult<Advertisement> {
    let manufacturer_data = device
        .manufacturer_data()
        .await?
        .and_then(|data| data.into_iter().min_by_key(|(company, _)| *company))
        .map(|(company_id, payload)| ManufacturerData {
            company_id,
            payload,
        });
    Ok(Advertisement {
        handle: PeripheralHandle::new(device.address().to_string()),
        local_name: device.name().await?,
        rssi: device.rssi().await?,
        manufacturer_data,
    })
}

#[async_trait]
impl Transport for BluezTransport {
    async fn scan(&self, pairing: &PairingIdentifier) -> TransportResult<()> {
        let uuids = {
            let mut tasks = self.tasks();
            tasks.filter_uuids.insert(pairing.service_uuid());
            tasks.filter_uuids.clone()
        };
        // Duplicate reports keep the RSSI property moving for known devices.
        let filter = DiscoveryFilter {
            uuids,
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..DiscoveryFilter::default()
        };
        self.adapter
            .set_discovery_filter(filter)
            .await
            .map_err(|e| TransportError::ScanFailed(e.to_string()))?;
        let stream = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| TransportError::ScanFailed(e.to_string()))?;

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            pin_mut!(stream);
            while let Some(event) = stream.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                let sighting = match adapter.device(address) {
                    Ok(device) => advertisement(&device).await,
                    Err(e) => Err(e.into()),
                };
                match sighting {
                    Ok(sighting) => {
                        debug!(handle = %sighting.handle, name = ?sighting.local_name, "Advertisement");
                        if events.send(TransportEvent::Advertisement(sighting)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%address, error = %e, "Failed to read advertisement"),
                }
            }
        });

        if let Some(previous) = self.tasks().discovery.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        // Dropping the discovery stream stops discovery in bluetoothd.
        let mut tasks = self.tasks();
        tasks.filter_uuids.clear();
        if let Some(task) = tasks.discovery.take() {
            task.abort();
        }
        Ok(())
    }

    async fn connect(&self, handle: &PeripheralHandle) -> TransportResult<()> {
        let device = self.device(handle)?;
        device
            .connect()
            .await
            .map_err(|e| TransportError::ConnectFailed {
                handle: handle.clone(),
                reason: e.to_string(),
            })?;

        let device_events = device.events().await?;
        let events = self.events.clone();
        let watched = handle.clone();
        let watcher = tokio::spawn(async move {
            pin_mut!(device_events);
            while let Some(event) = device_events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    let _ = events.send(TransportEvent::Disconnected {
                        handle: watched.clone(),
                        reason: None,
                    });
                    break;
                }
            }
        });
        self.track_task(handle, watcher);
        Ok(())
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> TransportResult<()> {
        self.abort_device_tasks(handle);
        let device = self.device(handle)?;
        if device.is_connected().await? {
            device.disconnect().await?;
        }
        Ok(())
    }

    async fn discover_services(
        &self,
        handle: &PeripheralHandle,
        services: &[Uuid],
    ) -> TransportResult<Vec<Uuid>> {
        let device = self.connected_device(handle).await?;
        self.wait_services_resolved(&device).await?;
        let mut found = Vec::new();
        for service in device.services().await? {
            let uuid = service.uuid().await?;
            if services.contains(&uuid) {
                found.push(uuid);
            }
        }
        Ok(found)
    }

    async fn discover_characteristics(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
    ) -> TransportResult<Vec<Uuid>> {
        let device = self.connected_device(handle).await?;
        let service = self.service(&device, service).await?;
        let mut characteristics = Vec::new();
        for characteristic in service.characteristics().await? {
            characteristics.push(characteristic.uuid().await?);
        }
        Ok(characteristics)
    }

    async fn read_value(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
    ) -> TransportResult<Vec<u8>> {
        self.characteristic(handle, characteristic)
            .await?
            .read()
            .await
            .map_err(|e| TransportError::ReadFailed {
                characteristic: characteristic.characteristic,
                reason: e.to_string(),
            })
    }

    async fn write_value(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
        value: u8,
        reliable: bool,
    ) -> TransportResult<()> {
        let request = CharacteristicWriteRequest {
            op_type: if reliable {
                WriteOp::Request
            } else {
                WriteOp::Command
            },
            ..CharacteristicWriteRequest::default()
        };
        self.characteristic(handle, characteristic)
            .await?
            .write_ext(&[value], &request)
            .await
            .map_err(|e| TransportError::WriteFailed {
                characteristic: characteristic.characteristic,
                reason: e.to_string(),
            })
    }

    async fn subscribe_notifications(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
    ) -> TransportResult<()> {
        let notifications = self
            .characteristic(handle, characteristic)
            .await?
            .notify()
            .await?;
        let events = self.events.clone();
        let source = handle.clone();
        let id = *characteristic;
        let task = tokio::spawn(async move {
            pin_mut!(notifications);
            while let Some(payload) = notifications.next().await {
                let event = TransportEvent::Notification {
                    handle: source.clone(),
                    characteristic: id,
                    payload,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        });
        self.track_task(handle, task);
        Ok(())
    }

    async fn read_signal_strength(&self, handle: &PeripheralHandle) -> TransportResult<i16> {
        self.connected_device(handle)
            .await?
            .rssi()
            .await?
            .ok_or_else(|| TransportError::Backend(format!("no RSSI available for {handle}")))
    }

    fn signal_strength_needs_scan(&self) -> bool {
        true
    }
}
