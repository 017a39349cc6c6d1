//! Error types for the sensor link and capture pipeline.
//!
//! Transport and profile errors abort a connect attempt and are surfaced to
//! the UI. Decode errors are counted and dropped. Capture errors are surfaced
//! and the capture re-arms.

use crate::domain::models::Channel;
use crate::infrastructure::bluetooth::protocol::ProfileKind;
use thiserror::Error;
use uuid::Uuid;

/// Failures reported by the BLE transport. Retrying the whole connect
/// sequence is a reasonable reaction to any of these.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("bluetooth adapter error: {0}")]
    Adapter(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("GATT discovery failed: {0}")]
    Discovery(String),
    #[error("characteristic I/O failed: {0}")]
    Io(String),
    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: &'static str, millis: u64 },
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("unknown characteristic: {0}")]
    UnknownCharacteristic(Uuid),
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::DeviceNotFound => Self::UnknownDevice(e.to_string()),
            btleplug::Error::NotConnected => Self::Connect(e.to_string()),
            btleplug::Error::TimedOut(d) => Self::Timeout {
                operation: "bluetooth operation",
                millis: d.as_millis() as u64,
            },
            other => Self::Adapter(other.to_string()),
        }
    }
}

/// The connected device does not expose a usable profile.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("neither the Watch nor the MetaWear service was found")]
    ServiceNotFound,
    #[error("{profile:?} service is missing its {role} characteristic {uuid}")]
    CharacteristicNotFound {
        profile: ProfileKind,
        role: &'static str,
        uuid: Uuid,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ResolveError {
    /// Only transport hiccups during discovery are worth another attempt;
    /// a missing service or characteristic needs a different device.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// A notification payload that could not be turned into a sample.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty notification")]
    Empty,
    #[error("unknown channel tag {0:#04x}")]
    UnknownChannel(u8),
    #[error("{channel:?} payload too short: expected {expected} bytes, got {actual}")]
    ShortPayload {
        channel: Channel,
        expected: usize,
        actual: usize,
    },
    #[error("{0:?} payload is not a finite number")]
    NonFinite(Channel),
}

#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("device link is not connected")]
    NotConnected,
    #[error("device link is already connected to {0}")]
    AlreadyConnected(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    ProfileMismatch(#[from] ResolveError),
    #[error("device disconnected while the link was being set up")]
    DisconnectedDuringConnect,
}

impl LinkError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::DisconnectedDuringConnect => true,
            Self::ProfileMismatch(e) => e.is_retryable(),
            Self::NotConnected | Self::AlreadyConnected(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("could not write capture: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not serialize capture: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture window closed without any sensor data")]
    Empty,
    #[error("no capture is in progress")]
    NotActive,
    #[error(transparent)]
    Export(#[from] ExportError),
}
