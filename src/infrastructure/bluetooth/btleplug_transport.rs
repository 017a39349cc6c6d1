//! [`BleTransport`] on top of btleplug.
//!
//! Peripherals are addressed by their platform id string (MAC address on
//! Linux, UUID on macOS/Windows). Adapter disconnect events and per-device
//! notification streams are forwarded to one broadcast channel.

use crate::domain::models::DeviceRef;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharProperties, ConnectParams, GattCharacteristic, GattService, TransportEvent,
    WriteKind,
};
use async_trait::async_trait;
use btleplug::api::{
    CentralEvent, CharPropFlags, Characteristic, Central as _, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;
/// BlueZ can hang in GATT discovery when the device walks out of range.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BtleplugTransport {
    adapter: Adapter,
    peripherals: Mutex<HashMap<String, Peripheral>>,
    pumps: Mutex<HashMap<String, JoinHandle<()>>>,
    scanning: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    watcher: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter and start watching it.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Adapter("No Bluetooth adapter found".into()))?;

        #[cfg(target_os = "macos")]
        wait_for_power_on(&adapter).await;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut central_events = adapter.events().await?;
        let sender = events.clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    debug!("Adapter reports {} disconnected", id);
                    let _ = sender.send(TransportEvent::DeviceDisconnected(id.to_string()));
                }
            }
            warn!("Adapter event stream ended");
        });

        info!("Bluetooth adapter ready");
        Ok(Self {
            adapter,
            peripherals: Mutex::new(HashMap::new()),
            pumps: Mutex::new(HashMap::new()),
            scanning: AtomicBool::new(false),
            events,
            watcher,
        })
    }

    async fn peripheral(&self, device: &DeviceRef) -> Result<Peripheral, TransportError> {
        let cached = lock(&self.peripherals).get(&device.id).cloned();
        if let Some(peripheral) = cached {
            return Ok(peripheral);
        }
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.id().to_string() == device.id {
                lock(&self.peripherals).insert(device.id.clone(), peripheral.clone());
                return Ok(peripheral);
            }
        }
        Err(TransportError::UnknownDevice(device.id.clone()))
    }

    fn characteristic(
        peripheral: &Peripheral,
        wanted: &GattCharacteristic,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == wanted.uuid && c.service_uuid == wanted.service_uuid)
            .ok_or(TransportError::UnknownCharacteristic(wanted.uuid))
    }

    /// One notification pump per device, started on first subscribe.
    fn ensure_pump(&self, device_id: &str, peripheral: Peripheral) {
        let mut pumps = lock(&self.pumps);
        if pumps.get(device_id).is_some_and(|task| !task.is_finished()) {
            return;
        }
        let sender = self.events.clone();
        let id = device_id.to_string();
        let task = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Could not open notification stream for {}: {}", id, e);
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                let _ = sender.send(TransportEvent::Notification {
                    device_id: id.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
            debug!("Notification stream for {} ended", id);
        });
        pumps.insert(device_id.to_string(), task);
    }

    fn stop_pump(&self, device_id: &str) {
        if let Some(task) = lock(&self.pumps).remove(device_id) {
            task.abort();
        }
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.watcher.abort();
        for (_, task) in lock(&self.pumps).drain() {
            task.abort();
        }
    }
}

fn properties(flags: CharPropFlags) -> CharProperties {
    CharProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn start_scan(&self) -> Result<(), TransportError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.scanning.store(false, Ordering::SeqCst);
        self.adapter.stop_scan().await?;
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    async fn discovered(&self) -> Result<Vec<DeviceRef>, TransportError> {
        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let id = peripheral.id().to_string();
            let props = match peripheral.properties().await {
                Ok(props) => props.unwrap_or_default(),
                Err(e) => {
                    debug!("No properties for {}: {}", id, e);
                    continue;
                }
            };
            let mut device = DeviceRef::new(
                id.clone(),
                props.local_name.unwrap_or_else(|| "Unknown".into()),
            );
            device.rssi = props.rssi;
            device.services = props.services;
            lock(&self.peripherals).insert(id, peripheral);
            found.push(device);
        }
        Ok(found)
    }

    async fn connect(
        &self,
        device: &DeviceRef,
        params: ConnectParams,
    ) -> Result<(), TransportError> {
        // btleplug only speaks LE and never reconnects on its own.
        debug!("Connecting to {} with {:?}", device.id, params);
        let peripheral = self.peripheral(device).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }

    async fn disconnect(&self, device: &DeviceRef) -> Result<(), TransportError> {
        self.stop_pump(&device.id);
        let peripheral = self.peripheral(device).await?;
        if peripheral.is_connected().await.unwrap_or(true) {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn services(&self, device: &DeviceRef) -> Result<Vec<GattService>, TransportError> {
        let peripheral = self.peripheral(device).await?;
        tokio::time::timeout(DISCOVERY_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "service discovery",
                millis: DISCOVERY_TIMEOUT.as_millis() as u64,
            })?
            .map_err(|e| TransportError::Discovery(e.to_string()))?;

        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        service_uuid: c.service_uuid,
                        properties: properties(c.properties),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn read(
        &self,
        device: &DeviceRef,
        characteristic: &GattCharacteristic,
    ) -> Result<Vec<u8>, TransportError> {
        let peripheral = self.peripheral(device).await?;
        let characteristic = Self::characteristic(&peripheral, characteristic)?;
        peripheral
            .read(&characteristic)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn write(
        &self,
        device: &DeviceRef,
        characteristic: &GattCharacteristic,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device).await?;
        let characteristic = Self::characteristic(&peripheral, characteristic)?;
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral
            .write(&characteristic, value, write_type)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn subscribe(
        &self,
        device: &DeviceRef,
        characteristic: &GattCharacteristic,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device).await?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.ensure_pump(&device.id, peripheral);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        device: &DeviceRef,
        characteristic: &GattCharacteristic,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device).await?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        peripheral
            .unsubscribe(&target)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// CoreBluetooth starts in an unknown state; scanning before it reports
/// powered-on is silently ignored.
#[cfg(target_os = "macos")]
async fn wait_for_power_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("Adapter still {:?} after 3 s, continuing", state);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Could not read adapter state: {}", e);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_flags_map_one_to_one() {
        let props = properties(CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::NOTIFY);
        assert!(props.can_write());
        assert!(props.can_notify());
        assert!(!props.write && !props.read && !props.indicate);

        let props = properties(CharPropFlags::READ | CharPropFlags::INDICATE);
        assert!(!props.can_write());
        assert!(props.can_notify());
    }
}
