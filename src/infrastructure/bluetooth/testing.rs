//! Scripted in-memory transport used by the link, scanner and service tests.

use crate::domain::models::DeviceRef;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::ProfileKind;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharProperties, ConnectParams, GattCharacteristic, GattService, TransportEvent,
    WriteKind,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

pub fn writable() -> CharProperties {
    CharProperties {
        write: true,
        ..Default::default()
    }
}

pub fn notifiable() -> CharProperties {
    CharProperties {
        notify: true,
        ..Default::default()
    }
}

pub fn characteristic(service: Uuid, uuid: Uuid, properties: CharProperties) -> GattCharacteristic {
    GattCharacteristic {
        uuid,
        service_uuid: service,
        properties,
    }
}

/// A complete service table for `profile`.
pub fn profile_service(profile: ProfileKind) -> GattService {
    let service = profile.service_uuid();
    GattService {
        uuid: service,
        characteristics: vec![
            characteristic(service, profile.command_uuid(), writable()),
            characteristic(service, profile.notify_uuid(), notifiable()),
        ],
    }
}

pub fn pod(id: &str) -> DeviceRef {
    DeviceRef::new(id, format!("MetaWear {id}"))
}

pub struct FakeTransport {
    services: Mutex<Vec<GattService>>,
    devices: Mutex<Vec<DeviceRef>>,
    calls: Mutex<Vec<String>>,
    writes: Mutex<Vec<Vec<u8>>>,
    scanning: AtomicBool,
    connect_failures: AtomicU32,
    write_failures: AtomicBool,
    connect_delay: Mutex<Duration>,
    emit_scan_stopped: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl FakeTransport {
    pub fn new(services: Vec<GattService>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            services: Mutex::new(services),
            devices: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            scanning: AtomicBool::new(false),
            connect_failures: AtomicU32::new(0),
            write_failures: AtomicBool::new(false),
            connect_delay: Mutex::new(Duration::ZERO),
            emit_scan_stopped: AtomicBool::new(false),
            events,
        }
    }

    pub fn with_profile(profile: ProfileKind) -> Self {
        Self::new(vec![profile_service(profile)])
    }

    pub fn set_devices(&self, devices: Vec<DeviceRef>) {
        *self.devices.lock().unwrap() = devices;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.write_failures.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    pub fn end_scans_early(&self) {
        self.emit_scan_stopped.store(true, Ordering::SeqCst);
    }

    pub fn set_scanning(&self, scanning: bool) {
        self.scanning.store(scanning, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn notify(&self, device: &DeviceRef, characteristic: Uuid, value: Vec<u8>) {
        let _ = self.events.send(TransportEvent::Notification {
            device_id: device.id.clone(),
            characteristic,
            value,
        });
    }

    /// Simulate the pod dropping the link on its own.
    pub fn drop_link(&self, device: &DeviceRef) {
        let _ = self
            .events
            .send(TransportEvent::DeviceDisconnected(device.id.clone()));
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn start_scan(&self) -> Result<(), TransportError> {
        self.record("start_scan");
        self.scanning.store(true, Ordering::SeqCst);
        if self.emit_scan_stopped.load(Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::ScanStopped);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record("stop_scan");
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    async fn discovered(&self) -> Result<Vec<DeviceRef>, TransportError> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn connect(
        &self,
        device: &DeviceRef,
        params: ConnectParams,
    ) -> Result<(), TransportError> {
        self.record(format!("connect:{}:{}", device.id, params.auto_reconnect));
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Connect("scripted failure".into()));
        }
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceRef) -> Result<(), TransportError> {
        self.record(format!("disconnect:{}", device.id));
        Ok(())
    }

    async fn services(&self, _device: &DeviceRef) -> Result<Vec<GattService>, TransportError> {
        self.record("services");
        Ok(self.services.lock().unwrap().clone())
    }

    async fn read(
        &self,
        _device: &DeviceRef,
        characteristic: &GattCharacteristic,
    ) -> Result<Vec<u8>, TransportError> {
        self.record(format!("read:{}", characteristic.uuid));
        Ok(Vec::new())
    }

    async fn write(
        &self,
        _device: &DeviceRef,
        characteristic: &GattCharacteristic,
        value: &[u8],
        _kind: WriteKind,
    ) -> Result<(), TransportError> {
        self.record(format!("write:{}", characteristic.uuid));
        if self.write_failures.load(Ordering::SeqCst) {
            return Err(TransportError::Io("scripted write failure".into()));
        }
        self.writes.lock().unwrap().push(value.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        _device: &DeviceRef,
        characteristic: &GattCharacteristic,
    ) -> Result<(), TransportError> {
        self.record(format!("subscribe:{}", characteristic.uuid));
        Ok(())
    }

    async fn unsubscribe(
        &self,
        _device: &DeviceRef,
        characteristic: &GattCharacteristic,
    ) -> Result<(), TransportError> {
        self.record(format!("unsubscribe:{}", characteristic.uuid));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
