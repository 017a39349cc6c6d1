use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Sensor stream carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    Accel,
    Gyro,
    Mag,
    Light,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Accel, Channel::Gyro, Channel::Mag, Channel::Light];

    /// Number of float values a decoded sample of this channel carries.
    pub fn arity(&self) -> usize {
        match self {
            Self::Light => 1,
            _ => 3,
        }
    }
}

/// A single 3-axis reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct XyzSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl XyzSample {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleValues {
    Xyz(XyzSample),
    Scalar(f32),
}

/// One decoded reading from one channel. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub timestamp: Timestamp,
    pub channel: Channel,
    pub values: SampleValues,
}

impl SensorSample {
    pub fn xyz(channel: Channel, timestamp: Timestamp, x: f32, y: f32, z: f32) -> Self {
        Self {
            timestamp,
            channel,
            values: SampleValues::Xyz(XyzSample::new(x, y, z)),
        }
    }

    pub fn light(timestamp: Timestamp, lux: f32) -> Self {
        Self {
            timestamp,
            channel: Channel::Light,
            values: SampleValues::Scalar(lux),
        }
    }

    pub fn as_xyz(&self) -> Option<XyzSample> {
        match self.values {
            SampleValues::Xyz(v) => Some(v),
            SampleValues::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<f32> {
        match self.values {
            SampleValues::Scalar(v) => Some(v),
            SampleValues::Xyz(_) => None,
        }
    }
}

/// All channels observed around one instant, merged into a single row.
///
/// Serialized field names are part of the export format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompositeDataPoint {
    pub timestamp: Timestamp,
    pub accel_x: Option<f32>,
    pub accel_y: Option<f32>,
    pub accel_z: Option<f32>,
    pub gyro_x: Option<f32>,
    pub gyro_y: Option<f32>,
    pub gyro_z: Option<f32>,
    pub mag_x: Option<f32>,
    pub mag_y: Option<f32>,
    pub mag_z: Option<f32>,
    pub light: Option<f32>,
}

impl CompositeDataPoint {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    /// Overwrite the fields belonging to the sample's channel.
    pub fn apply(&mut self, sample: &SensorSample) {
        match (sample.channel, sample.values) {
            (Channel::Accel, SampleValues::Xyz(v)) => {
                self.accel_x = Some(v.x);
                self.accel_y = Some(v.y);
                self.accel_z = Some(v.z);
            }
            (Channel::Gyro, SampleValues::Xyz(v)) => {
                self.gyro_x = Some(v.x);
                self.gyro_y = Some(v.y);
                self.gyro_z = Some(v.z);
            }
            (Channel::Mag, SampleValues::Xyz(v)) => {
                self.mag_x = Some(v.x);
                self.mag_y = Some(v.y);
                self.mag_z = Some(v.z);
            }
            (Channel::Light, SampleValues::Scalar(v)) => self.light = Some(v),
            // Channel/value shape mismatches never leave the demuxer.
            _ => {}
        }
    }

    /// Fill every field that is still empty here from `other`.
    pub fn fill_missing(&mut self, other: &CompositeDataPoint) {
        fn fill(dst: &mut Option<f32>, src: Option<f32>) {
            if dst.is_none() {
                *dst = src;
            }
        }
        fill(&mut self.accel_x, other.accel_x);
        fill(&mut self.accel_y, other.accel_y);
        fill(&mut self.accel_z, other.accel_z);
        fill(&mut self.gyro_x, other.gyro_x);
        fill(&mut self.gyro_y, other.gyro_y);
        fill(&mut self.gyro_z, other.gyro_z);
        fill(&mut self.mag_x, other.mag_x);
        fill(&mut self.mag_y, other.mag_y);
        fill(&mut self.mag_z, other.mag_z);
        fill(&mut self.light, other.light);
    }

    pub fn has(&self, channel: Channel) -> bool {
        match channel {
            Channel::Accel => self.accel_x.is_some(),
            Channel::Gyro => self.gyro_x.is_some(),
            Channel::Mag => self.mag_x.is_some(),
            Channel::Light => self.light.is_some(),
        }
    }
}

/// Discrete time-derivative of the accelerometer vector, per axis in g/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DerivativeRecord {
    pub timestamp: Timestamp,
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    pub magnitude: f64,
}

/// What opened a capture window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    Light,
    Spike,
    External,
}

/// A finished capture, frozen and ready for export.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureBundle {
    pub started_at: Timestamp,
    pub planned_end: Timestamp,
    pub trigger_source: TriggerSource,
    /// Ordered by timestamp; no two points within the dedup tolerance.
    pub points: Vec<CompositeDataPoint>,
    pub derivatives: Vec<DerivativeRecord>,
    pub trigger_timestamps: Vec<Timestamp>,
}

/// Where a persisted capture ended up.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureHandle {
    pub path: PathBuf,
    pub started_at: Timestamp,
    pub point_count: usize,
}

/// A peripheral seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    /// Platform identifier (MAC address on Linux, UUID on macOS/Windows).
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
    pub services: Vec<uuid::Uuid>,
}

impl DeviceRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi: None,
            services: Vec::new(),
        }
    }
}

/// Link state reported to the UI, without the resolved handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    ServiceDiscovery,
    CharacteristicDiscovery,
    NotificationsEnabling,
    Connected,
    Disconnecting,
    Failed,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Events delivered to the UI collaborator.
#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(DeviceRef),
    ConnectionState(ConnectionStatus),
    /// Throttled per channel; for display only.
    LiveSample(SensorSample),
    CaptureStarted {
        source: TriggerSource,
        at: Timestamp,
    },
    CaptureReady(CaptureHandle),
    CaptureError(String),
    LogMessage(StatusMessage),
}
