//! Telemetry Demuxer
//!
//! Splits raw notification payloads into typed [`SensorSample`]s. Bad frames
//! are counted and dropped, never raised.

use crate::domain::models::{Channel, SampleValues, SensorSample, Timestamp};
use crate::error::DecodeError;
use crate::infrastructure::bluetooth::protocol::{metawear_scale, ProfileKind};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Dropped-frame counts, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub decoded: u64,
    pub empty: u64,
    pub unknown_channel: u64,
    pub short_payload: u64,
    pub non_finite: u64,
}

impl DemuxStats {
    pub fn dropped(&self) -> u64 {
        self.empty + self.unknown_channel + self.short_payload + self.non_finite
    }
}

#[derive(Debug, Default)]
pub struct TelemetryDemuxer {
    decoded: AtomicU64,
    empty: AtomicU64,
    unknown_channel: AtomicU64,
    short_payload: AtomicU64,
    non_finite: AtomicU64,
}

impl TelemetryDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one notification, stamping it with `received_at`.
    pub fn demux(
        &self,
        profile: ProfileKind,
        raw: &[u8],
        received_at: Timestamp,
    ) -> Option<SensorSample> {
        match decode_frame(profile, raw, received_at) {
            Ok(sample) => {
                self.decoded.fetch_add(1, Ordering::Relaxed);
                trace!("{:?} sample at {}", sample.channel, received_at);
                Some(sample)
            }
            Err(e) => {
                let counter = match e {
                    DecodeError::Empty => &self.empty,
                    DecodeError::UnknownChannel(_) => &self.unknown_channel,
                    DecodeError::ShortPayload { .. } => &self.short_payload,
                    DecodeError::NonFinite(_) => &self.non_finite,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                debug!("Dropped {:?} frame: {}", profile, e);
                None
            }
        }
    }

    pub fn stats(&self) -> DemuxStats {
        DemuxStats {
            decoded: self.decoded.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            unknown_channel: self.unknown_channel.load(Ordering::Relaxed),
            short_payload: self.short_payload.load(Ordering::Relaxed),
            non_finite: self.non_finite.load(Ordering::Relaxed),
        }
    }
}

/// Split the frame header off and decode the rest.
pub fn decode_frame(
    profile: ProfileKind,
    raw: &[u8],
    timestamp: Timestamp,
) -> Result<SensorSample, DecodeError> {
    let first = *raw.first().ok_or(DecodeError::Empty)?;
    let header_len = profile.header_len();
    if raw.len() < header_len {
        return Err(DecodeError::UnknownChannel(first));
    }
    let channel = profile
        .channel_for_header(&raw[..header_len])
        .ok_or(DecodeError::UnknownChannel(first))?;
    decode(profile, channel, &raw[header_len..], timestamp)
}

/// Decode a channel payload (header already stripped). Trailing bytes are
/// ignored. NaN or infinite readings are rejected.
pub fn decode(
    profile: ProfileKind,
    channel: Channel,
    payload: &[u8],
    timestamp: Timestamp,
) -> Result<SensorSample, DecodeError> {
    let expected = profile.payload_len(channel);
    if payload.len() < expected {
        return Err(DecodeError::ShortPayload {
            channel,
            expected,
            actual: payload.len(),
        });
    }

    let sample = match profile {
        ProfileKind::Watch => {
            let f = |i: usize| {
                f32::from_le_bytes([
                    payload[i * 4],
                    payload[i * 4 + 1],
                    payload[i * 4 + 2],
                    payload[i * 4 + 3],
                ])
            };
            match channel {
                Channel::Light => SensorSample::light(timestamp, f(0)),
                _ => SensorSample::xyz(channel, timestamp, f(0), f(1), f(2)),
            }
        }
        ProfileKind::MetaWear => {
            let i = |n: usize| i16::from_le_bytes([payload[n * 2], payload[n * 2 + 1]]) as f32;
            match channel {
                Channel::Light => {
                    let milli_lux =
                        u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    SensorSample::light(timestamp, milli_lux as f32 * metawear_scale::LIGHT)
                }
                Channel::Accel => {
                    scaled(channel, timestamp, [i(0), i(1), i(2)], metawear_scale::ACCEL)
                }
                Channel::Gyro => {
                    scaled(channel, timestamp, [i(0), i(1), i(2)], metawear_scale::GYRO)
                }
                Channel::Mag => {
                    scaled(channel, timestamp, [i(0), i(1), i(2)], metawear_scale::MAG)
                }
            }
        }
    };

    if !is_finite(&sample) {
        return Err(DecodeError::NonFinite(channel));
    }
    Ok(sample)
}

fn is_finite(sample: &SensorSample) -> bool {
    match sample.values {
        SampleValues::Xyz(v) => v.x.is_finite() && v.y.is_finite() && v.z.is_finite(),
        SampleValues::Scalar(v) => v.is_finite(),
    }
}

fn scaled(channel: Channel, timestamp: Timestamp, raw: [f32; 3], scale: f32) -> SensorSample {
    SensorSample::xyz(channel, timestamp, raw[0] * scale, raw[1] * scale, raw[2] * scale)
}
