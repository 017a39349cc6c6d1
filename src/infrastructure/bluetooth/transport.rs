//! BLE Transport Abstraction
//!
//! The capture core only needs a narrow slice of a BLE stack: scanning,
//! connecting, GATT enumeration, characteristic I/O, notifications and a
//! disconnect signal. [`BleTransport`] is that slice; the btleplug adapter
//! implements it for real hardware.

use crate::domain::models::DeviceRef;
use crate::error::TransportError;
use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    LowEnergy,
}

/// Explicit connect parameters; the link never relies on stack defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    pub auto_reconnect: bool,
    pub transport: TransportKind,
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            transport: TransportKind::LowEnergy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProperties {
    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Notification {
        device_id: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    DeviceDisconnected(String),
    /// The stack ended a scan on its own. Not every platform sends this.
    ScanStopped,
}

#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    async fn start_scan(&self) -> Result<(), TransportError>;
    async fn stop_scan(&self) -> Result<(), TransportError>;
    fn is_scanning(&self) -> bool;
    /// Peripherals seen since the adapter came up.
    async fn discovered(&self) -> Result<Vec<DeviceRef>, TransportError>;

    async fn connect(&self, device: &DeviceRef, params: ConnectParams)
        -> Result<(), TransportError>;
    async fn disconnect(&self, device: &DeviceRef) -> Result<(), TransportError>;

    /// Run GATT discovery and return the service table.
    async fn services(&self, device: &DeviceRef) -> Result<Vec<GattService>, TransportError>;

    async fn read(
        &self,
        device: &DeviceRef,
        characteristic: &GattCharacteristic,
    ) -> Result<Vec<u8>, TransportError>;
    async fn write(
        &self,
        device: &DeviceRef,
        characteristic: &GattCharacteristic,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError>;
    async fn subscribe(
        &self,
        device: &DeviceRef,
        characteristic: &GattCharacteristic,
    ) -> Result<(), TransportError>;
    async fn unsubscribe(
        &self,
        device: &DeviceRef,
        characteristic: &GattCharacteristic,
    ) -> Result<(), TransportError>;

    /// Register for notifications, disconnects and scan-end events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
