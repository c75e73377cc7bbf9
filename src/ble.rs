use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        PeripheralProperties, ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    advertisement::AdvertisementBuilder,
    error::{NexusError, Result},
    radio::{
        GattCharacteristic, GattService, GattStatus, LinkState, Radio, RadioEvent,
        SubscriptionKind,
    },
    types::DeviceId,
};

const BLUETOOTH_BASE_MASK: u128 = 0xFFFF_FFFF_FFFF_FFFF_FFFF_FFFF;
/// Low 96 bits of the Bluetooth base UUID `xxxxxxxx-0000-1000-8000-00805f9b34fb`
const BLUETOOTH_BASE_SUFFIX: u128 = 0x0000_1000_8000_0080_5F9B_34FB;

/// Check if a UUID was advertised in full rather than as a 16 or 32-bit alias
fn is_full_uuid(uuid: &Uuid) -> bool {
    uuid.as_u128() & BLUETOOTH_BASE_MASK != BLUETOOTH_BASE_SUFFIX
}

/// Encode the advertised properties of a peripheral as a GAP payload
///
/// btleplug hands out parsed properties rather than raw advertising data;
/// re-encoding them keeps the advertisement parser the only classifier.
/// btleplug widens 16 and 32-bit service aliases to 128 bits, so those are
/// left out of the 128-bit list. Returns `None` until the peripheral has
/// shown a full 128-bit service UUID, so it is not judged on a partial
/// advertisement.
#[must_use]
pub fn advertisement_payload(properties: &PeripheralProperties) -> Option<Bytes> {
    let services: Vec<Uuid> = properties
        .services
        .iter()
        .copied()
        .filter(is_full_uuid)
        .collect();
    if services.is_empty() {
        return None;
    }

    let mut builder = AdvertisementBuilder::new();
    if let Some(name) = &properties.local_name {
        builder = builder.complete_name(name);
    }
    builder = builder.incomplete_uuids(&services);
    let mut companies: Vec<_> = properties.manufacturer_data.iter().collect();
    companies.sort_by_key(|(company, _)| **company);
    for (company, data) in companies {
        builder = builder.manufacturer_data(*company, data);
    }
    Some(builder.build())
}

fn gatt_characteristic(characteristic: &Characteristic) -> GattCharacteristic {
    let flags = characteristic.properties;
    GattCharacteristic {
        uuid: characteristic.uuid,
        read: flags.contains(CharPropFlags::READ),
        write: flags.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

fn status_of<T>(result: &std::result::Result<T, btleplug::Error>, what: &str) -> GattStatus {
    match result {
        Ok(_) => GattStatus::SUCCESS,
        Err(err) => {
            warn!(error = %err, "{what} failed");
            GattStatus::INTERNAL_ERROR
        }
    }
}

fn device_id(peripheral: &Peripheral) -> DeviceId {
    DeviceId::new(peripheral.address().to_string())
}

type Peripherals = Arc<Mutex<HashMap<DeviceId, Peripheral>>>;

/// [`Radio`] backed by the host Bluetooth stack through btleplug
///
/// Every request runs on its own task and reports back through the event
/// channel returned by [`BtleplugRadio::new`].
pub struct BtleplugRadio {
    manager: Manager,
    adapter: RwLock<Option<Adapter>>,
    peripherals: Peripherals,
    events: mpsc::UnboundedSender<RadioEvent>,
    central_pump: StdMutex<Option<JoinHandle<()>>>,
    notification_pumps: Arc<StdMutex<HashMap<DeviceId, JoinHandle<()>>>>,
}

impl std::fmt::Debug for BtleplugRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugRadio").finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl BtleplugRadio {
    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::AdapterNotFound`] if the host has no adapter, or
    /// [`NexusError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<RadioEvent>)> {
        let manager = Manager::new().await?;
        let adapter = first_adapter(&manager).await?;
        if let Ok(info) = adapter.adapter_info().await {
            info!(adapter = %info, "using bluetooth adapter");
        }

        let (events, rx) = mpsc::unbounded_channel();
        let radio = Self {
            manager,
            adapter: RwLock::new(Some(adapter)),
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            events,
            central_pump: StdMutex::new(None),
            notification_pumps: Arc::new(StdMutex::new(HashMap::new())),
        };
        Ok((radio, rx))
    }

    async fn adapter(&self) -> Result<Adapter> {
        self.adapter
            .read()
            .await
            .clone()
            .ok_or(NexusError::AdapterNotFound)
    }

    async fn peripheral(&self, device: &DeviceId) -> Option<Peripheral> {
        self.peripherals.lock().await.get(device).cloned()
    }

    async fn characteristic(&self, device: &DeviceId, uuid: Uuid) -> Option<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(device).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)?;
        Some((peripheral, characteristic))
    }

    /// Forward adapter events as advertisements and disconnects
    fn start_central_pump(&self, adapter: Adapter) {
        let mut slot = lock(&self.central_pump);
        if slot.as_ref().is_some_and(|pump| !pump.is_finished()) {
            return;
        }

        let events = self.events.clone();
        let peripherals = self.peripherals.clone();
        *slot = Some(tokio::spawn(async move {
            let mut stream = match adapter.events().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "could not subscribe to adapter events");
                    return;
                }
            };

            while let Some(event) = stream.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => {
                        let Ok(peripheral) = adapter.peripheral(&id).await else {
                            continue;
                        };
                        let Ok(Some(properties)) = peripheral.properties().await else {
                            continue;
                        };
                        let device = device_id(&peripheral);
                        trace!(device = %device, rssi = ?properties.rssi, "advertisement");
                        peripherals.lock().await.insert(device.clone(), peripheral);

                        let Some(payload) = advertisement_payload(&properties) else {
                            trace!(device = %device, "no 128-bit service advertised yet");
                            continue;
                        };
                        let advertisement = RadioEvent::Advertisement {
                            device,
                            rssi: properties.rssi.unwrap_or(0),
                            payload,
                        };
                        if events.send(advertisement).is_err() {
                            break;
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let Ok(peripheral) = adapter.peripheral(&id).await else {
                            continue;
                        };
                        // The only source of disconnect events, requested or not
                        let device = device_id(&peripheral);
                        debug!(device = %device, "link dropped");
                        let _ = events.send(RadioEvent::ConnectionStateChanged {
                            device,
                            status: GattStatus::SUCCESS,
                            state: LinkState::Disconnected,
                        });
                    }
                    _ => {}
                }
            }
        }));
    }

    fn stop_central_pump(&self) {
        if let Some(pump) = lock(&self.central_pump).take() {
            pump.abort();
        }
    }
}

async fn first_adapter(manager: &Manager) -> Result<Adapter> {
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(NexusError::AdapterNotFound)
}

fn spawn_notification_pump(
    device: DeviceId,
    peripheral: Peripheral,
    events: mpsc::UnboundedSender<RadioEvent>,
    pumps: &Arc<StdMutex<HashMap<DeviceId, JoinHandle<()>>>>,
) {
    let key = device.clone();
    let pump = tokio::spawn(async move {
        let mut notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(device = %device, error = %err, "could not open notification stream");
                return;
            }
        };
        while let Some(notification) = notifications.next().await {
            let changed = RadioEvent::CharacteristicChanged {
                characteristic: notification.uuid,
                value: Bytes::from(notification.value),
            };
            if events.send(changed).is_err() {
                break;
            }
        }
        debug!(device = %device, "notification stream closed");
    });

    if let Some(previous) = lock(pumps).insert(key, pump) {
        previous.abort();
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    async fn start_scan(&self) -> bool {
        let Ok(adapter) = self.adapter().await else {
            return false;
        };
        self.start_central_pump(adapter.clone());
        match adapter.start_scan(ScanFilter::default()).await {
            Ok(()) => {
                info!("scanning for robots");
                true
            }
            Err(err) => {
                warn!(error = %err, "could not start scanning");
                false
            }
        }
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter().await?.stop_scan().await?;
        debug!("scanning stopped");
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device).await.ok_or(NexusError::NotConnected)?;
        let events = self.events.clone();
        let pumps = self.notification_pumps.clone();
        let device = device.clone();

        tokio::spawn(async move {
            let (status, state) = match peripheral.connect().await {
                Ok(()) => {
                    spawn_notification_pump(device.clone(), peripheral, events.clone(), &pumps);
                    (GattStatus::SUCCESS, LinkState::Connected)
                }
                Err(err) => {
                    warn!(device = %device, error = %err, "connect failed");
                    (GattStatus::GATT_ERROR, LinkState::Disconnected)
                }
            };
            let _ = events.send(RadioEvent::ConnectionStateChanged {
                device,
                status,
                state,
            });
        });
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        if let Some(pump) = lock(&self.notification_pumps).remove(device) {
            pump.abort();
        }
        let peripheral = self.peripheral(device).await.ok_or(NexusError::NotConnected)?;
        peripheral.disconnect().await?;
        debug!(device = %device, "disconnect requested");
        Ok(())
    }

    async fn discover_services(&self, device: &DeviceId) -> bool {
        let Some(peripheral) = self.peripheral(device).await else {
            return false;
        };
        let events = self.events.clone();
        let device = device.clone();
        tokio::spawn(async move {
            let result = peripheral.discover_services().await;
            let status = status_of(&result, "service discovery");
            let _ = events.send(RadioEvent::ServicesDiscovered { device, status });
        });
        true
    }

    async fn services(&self, device: &DeviceId) -> Vec<GattService> {
        let Some(peripheral) = self.peripheral(device).await else {
            return Vec::new();
        };
        peripheral
            .services()
            .iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(gatt_characteristic).collect(),
            })
            .collect()
    }

    async fn read_characteristic(&self, device: &DeviceId, characteristic: Uuid) -> bool {
        let Some((peripheral, target)) = self.characteristic(device, characteristic).await else {
            return false;
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = peripheral.read(&target).await;
            let status = status_of(&result, "characteristic read");
            let _ = events.send(RadioEvent::CharacteristicRead {
                characteristic,
                status,
                value: result.map(Bytes::from).unwrap_or_default(),
            });
        });
        true
    }

    async fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: Uuid,
        value: Bytes,
    ) -> bool {
        let Some((peripheral, target)) = self.characteristic(device, characteristic).await else {
            return false;
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            trace!(characteristic = %characteristic, value = ?&value[..], "writing");
            let result = peripheral
                .write(&target, &value, WriteType::WithResponse)
                .await;
            let status = status_of(&result, "characteristic write");
            let _ = events.send(RadioEvent::CharacteristicWrite {
                characteristic,
                status,
            });
        });
        true
    }

    async fn set_notification(
        &self,
        device: &DeviceId,
        characteristic: Uuid,
        kind: SubscriptionKind,
        enabled: bool,
    ) -> bool {
        let Some((peripheral, target)) = self.characteristic(device, characteristic).await else {
            return false;
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            debug!(characteristic = %characteristic, ?kind, enabled, "writing client configuration");
            let result = if enabled {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            let status = status_of(&result, "descriptor write");
            let _ = events.send(RadioEvent::DescriptorWrite {
                characteristic,
                status,
            });
        });
        true
    }

    async fn disable_adapter(&self) -> Result<()> {
        // btleplug has no power control: drop every link and release the adapter.
        self.stop_central_pump();
        let pumps: Vec<_> = lock(&self.notification_pumps).drain().collect();
        for (_, pump) in pumps {
            pump.abort();
        }

        let adapter = self.adapter.write().await.take();
        if let Some(adapter) = adapter {
            if let Err(err) = adapter.stop_scan().await {
                debug!(error = %err, "stop scan during adapter reset");
            }
        }

        let peripherals: Vec<_> = self.peripherals.lock().await.drain().collect();
        for (device, peripheral) in peripherals {
            if peripheral.is_connected().await.unwrap_or(false) {
                if let Err(err) = peripheral.disconnect().await {
                    warn!(device = %device, error = %err, "could not drop link during reset");
                }
            }
        }
        info!("adapter released");
        Ok(())
    }

    async fn enable_adapter(&self) -> Result<()> {
        let adapter = first_adapter(&self.manager).await?;
        *self.adapter.write().await = Some(adapter);
        info!("adapter acquired");
        Ok(())
    }

    async fn is_adapter_enabled(&self) -> bool {
        self.adapter.read().await.is_some()
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.stop_central_pump();
        for (_, pump) in lock(&self.notification_pumps).drain() {
            pump.abort();
        }
    }
}
