//! Sensor Pod Protocol
//!
//! GATT UUIDs, notification framing and sensor start/stop commands for the
//! two supported pod profiles. The profile is resolved once at connect time
//! and every profile-specific decision goes through [`ProfileKind`].

use crate::domain::models::Channel;
use crate::infrastructure::bluetooth::transport::WriteKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Watch pod service (Nordic UART layout).
pub const WATCH_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Watch command characteristic: host writes ASCII commands here.
pub const WATCH_COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Watch notify characteristic: tagged sensor frames arrive here.
pub const WATCH_NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// MetaWear primary service.
pub const METAWEAR_SERVICE_UUID: Uuid = Uuid::from_u128(0x326a9000_85cb_9195_d9dd_464cfbbae75a);
/// MetaWear command characteristic (register writes).
pub const METAWEAR_COMMAND_CHAR_UUID: Uuid =
    Uuid::from_u128(0x326a9001_85cb_9195_d9dd_464cfbbae75a);
/// MetaWear notify characteristic (module/register framed data).
pub const METAWEAR_NOTIFY_CHAR_UUID: Uuid =
    Uuid::from_u128(0x326a9006_85cb_9195_d9dd_464cfbbae75a);

/// Watch frame tags, first byte of every notification.
pub mod watch_tag {
    pub const ACCEL: u8 = b'A';
    pub const GYRO: u8 = b'G';
    pub const MAG: u8 = b'M';
    pub const LIGHT: u8 = b'L';
}

/// MetaWear module ids and the data register each one notifies on.
pub mod metawear_module {
    pub const ACCEL: u8 = 0x03;
    pub const GYRO: u8 = 0x13;
    pub const LIGHT: u8 = 0x14;
    pub const MAG: u8 = 0x15;

    pub const ACCEL_DATA: u8 = 0x04;
    pub const GYRO_DATA: u8 = 0x05;
    pub const LIGHT_DATA: u8 = 0x03;
    pub const MAG_DATA: u8 = 0x05;

    /// Register that powers a module's sampling on (1) or off (0).
    pub const POWER: u8 = 0x01;
    /// Register that enables or disables data notifications.
    pub const ENABLE: u8 = 0x02;
}

/// Raw-to-physical scale factors for MetaWear fixed-point payloads.
pub mod metawear_scale {
    /// ±2 g range: 16384 LSB per g.
    pub const ACCEL: f32 = 1.0 / 16384.0;
    /// ±2000 °/s range: 16.4 LSB per °/s.
    pub const GYRO: f32 = 1.0 / 16.4;
    /// 16 LSB per µT.
    pub const MAG: f32 = 1.0 / 16.0;
    /// Payload is milli-lux.
    pub const LIGHT: f32 = 1.0 / 1000.0;
}

/// The two GATT layouts a sensor pod may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProfileKind {
    Watch,
    MetaWear,
}

impl ProfileKind {
    /// Profiles in resolution order: Watch is preferred when both are present.
    pub const PREFERENCE: [ProfileKind; 2] = [ProfileKind::Watch, ProfileKind::MetaWear];

    pub fn service_uuid(&self) -> Uuid {
        match self {
            Self::Watch => WATCH_SERVICE_UUID,
            Self::MetaWear => METAWEAR_SERVICE_UUID,
        }
    }

    pub fn command_uuid(&self) -> Uuid {
        match self {
            Self::Watch => WATCH_COMMAND_CHAR_UUID,
            Self::MetaWear => METAWEAR_COMMAND_CHAR_UUID,
        }
    }

    pub fn notify_uuid(&self) -> Uuid {
        match self {
            Self::Watch => WATCH_NOTIFY_CHAR_UUID,
            Self::MetaWear => METAWEAR_NOTIFY_CHAR_UUID,
        }
    }

    pub fn write_kind(&self) -> WriteKind {
        match self {
            Self::Watch => WriteKind::WithResponse,
            Self::MetaWear => WriteKind::WithoutResponse,
        }
    }

    /// Length of the frame header preceding the channel payload.
    pub fn header_len(&self) -> usize {
        match self {
            Self::Watch => 1,
            Self::MetaWear => 2,
        }
    }

    /// Payload length for a channel under this profile's encoding.
    pub fn payload_len(&self, channel: Channel) -> usize {
        match (self, channel) {
            (Self::Watch, c) => 4 * c.arity(),
            (Self::MetaWear, Channel::Light) => 4,
            (Self::MetaWear, _) => 6,
        }
    }

    /// Identify which channel a frame header belongs to.
    pub fn channel_for_header(&self, header: &[u8]) -> Option<Channel> {
        use metawear_module as mw;
        match self {
            Self::Watch => match header.first()? {
                &watch_tag::ACCEL => Some(Channel::Accel),
                &watch_tag::GYRO => Some(Channel::Gyro),
                &watch_tag::MAG => Some(Channel::Mag),
                &watch_tag::LIGHT => Some(Channel::Light),
                _ => None,
            },
            Self::MetaWear => match (header.first()?, header.get(1)?) {
                (&mw::ACCEL, &mw::ACCEL_DATA) => Some(Channel::Accel),
                (&mw::GYRO, &mw::GYRO_DATA) => Some(Channel::Gyro),
                (&mw::MAG, &mw::MAG_DATA) => Some(Channel::Mag),
                (&mw::LIGHT, &mw::LIGHT_DATA) => Some(Channel::Light),
                _ => None,
            },
        }
    }

    /// Frame header this profile uses for a channel.
    pub fn header_for(&self, channel: Channel) -> Vec<u8> {
        use metawear_module as mw;
        match (self, channel) {
            (Self::Watch, Channel::Accel) => vec![watch_tag::ACCEL],
            (Self::Watch, Channel::Gyro) => vec![watch_tag::GYRO],
            (Self::Watch, Channel::Mag) => vec![watch_tag::MAG],
            (Self::Watch, Channel::Light) => vec![watch_tag::LIGHT],
            (Self::MetaWear, Channel::Accel) => vec![mw::ACCEL, mw::ACCEL_DATA],
            (Self::MetaWear, Channel::Gyro) => vec![mw::GYRO, mw::GYRO_DATA],
            (Self::MetaWear, Channel::Mag) => vec![mw::MAG, mw::MAG_DATA],
            (Self::MetaWear, Channel::Light) => vec![mw::LIGHT, mw::LIGHT_DATA],
        }
    }
}

/// Start or stop one sensor stream on the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorCommand {
    pub channel: Channel,
    pub enable: bool,
}

impl SensorCommand {
    pub fn start(channel: Channel) -> Self {
        Self {
            channel,
            enable: true,
        }
    }

    pub fn stop(channel: Channel) -> Self {
        Self {
            channel,
            enable: false,
        }
    }

    /// Encode as the sequence of writes the profile expects, in order.
    ///
    /// MetaWear: enabling turns notifications on before powering the sensor,
    /// disabling powers it off before turning notifications off.
    pub fn encode(&self, profile: ProfileKind) -> Vec<Vec<u8>> {
        match profile {
            ProfileKind::Watch => {
                let tag = ProfileKind::Watch.header_for(self.channel)[0] as char;
                let verb = if self.enable { "START" } else { "STOP" };
                vec![format!("{verb}:{tag}\n").into_bytes()]
            }
            ProfileKind::MetaWear => {
                let module = ProfileKind::MetaWear.header_for(self.channel)[0];
                let on = u8::from(self.enable);
                let notify = vec![module, metawear_module::ENABLE, on];
                let power = vec![module, metawear_module::POWER, on];
                if self.enable {
                    vec![notify, power]
                } else {
                    vec![power, notify]
                }
            }
        }
    }
}
