//! Bluetooth Module
//!
//! BLE link to the sensor pod.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (scan + connect-with-retry, public API for the app)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌───────────┐  ┌─────────────┐  ┌────────────┐
//! │  Scanner  │  │ DeviceLink  │  │ Telemetry  │
//! │           │  │ (connection)│  │  Demuxer   │
//! │ - hard    │  │ - state     │  │ - framing  │
//! │   timeout │  │   machine   │  │ - scaling  │
//! └─────┬─────┘  └──────┬──────┘  └────────────┘
//!       │               │ Resolver
//!       ▼               ▼
//! ┌─────────────────────────────────────────────┐
//! │        BleTransport (btleplug adapter)       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Profile UUIDs, frame headers and sensor commands
//! - [`transport`] - Narrow BLE adapter trait
//! - [`btleplug_transport`] - `BleTransport` on top of btleplug
//! - [`resolver`] - GATT service/characteristic resolution
//! - [`connection`] - Device link state machine
//! - [`telemetry`] - Notification payload decoding
//! - [`scanner`] - Device discovery
//! - [`service`] - Main service coordinator

pub mod btleplug_transport;
pub mod connection;
pub mod protocol;
pub mod resolver;
pub mod scanner;
pub mod service;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use service::BluetoothService;
