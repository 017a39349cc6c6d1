//! Accelerometer spike detection.
//!
//! Each accelerometer sample after the first yields a derivative record.
//! A spike fires when the derivative magnitude reaches the current
//! threshold: a fixed fallback until `window_size` magnitudes have been
//! seen, then `max(average * spike_multiplier, minimum_threshold)` over the
//! preceding window.

use crate::domain::models::{Channel, DerivativeRecord, SensorSample, Timestamp, XyzSample};
use crate::domain::settings::SpikeSettings;
use std::collections::VecDeque;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeEvent {
    pub timestamp: Timestamp,
    pub magnitude: f64,
    pub threshold: f64,
    /// First spike since the detector was last reset. Diagnostic only.
    pub first: bool,
}

#[derive(Debug, Clone)]
pub struct SpikeDetector {
    settings: SpikeSettings,
    previous: Option<(Timestamp, XyzSample)>,
    magnitudes: VecDeque<f64>,
    derivatives: Vec<DerivativeRecord>,
    trigger_timestamps: Vec<Timestamp>,
}

impl SpikeDetector {
    pub fn new(settings: SpikeSettings) -> Self {
        let window = settings.window_size.max(1);
        Self {
            settings: SpikeSettings {
                window_size: window,
                ..settings
            },
            previous: None,
            magnitudes: VecDeque::with_capacity(window),
            derivatives: Vec::new(),
            trigger_timestamps: Vec::new(),
        }
    }

    /// Feed one sample. Non-accelerometer samples are ignored.
    pub fn process(&mut self, sample: &SensorSample) -> Option<SpikeEvent> {
        if sample.channel != Channel::Accel {
            return None;
        }
        let current = sample.as_xyz()?;
        let ts = sample.timestamp;

        let Some((prev_ts, prev)) = self.previous else {
            self.previous = Some((ts, current));
            return None;
        };

        let dt_ms = ts - prev_ts;
        if dt_ms <= 0 {
            debug!("Skipping accel sample at {} (dt = {} ms)", ts, dt_ms);
            return None;
        }
        self.previous = Some((ts, current));

        let dt = dt_ms as f64 / 1000.0;
        let dx = (current.x as f64 - prev.x as f64) / dt;
        let dy = (current.y as f64 - prev.y as f64) / dt;
        let dz = (current.z as f64 - prev.z as f64) / dt;
        let magnitude = (dx * dx + dy * dy + dz * dz).sqrt();

        let threshold = self.threshold();
        let is_spike = magnitude >= threshold;

        if self.magnitudes.len() == self.settings.window_size {
            self.magnitudes.pop_front();
        }
        self.magnitudes.push_back(magnitude);

        self.derivatives.push(DerivativeRecord {
            timestamp: ts,
            dx,
            dy,
            dz,
            magnitude,
        });

        if !is_spike {
            return None;
        }

        let first = self.trigger_timestamps.is_empty();
        self.trigger_timestamps.push(ts);
        if first {
            info!(
                "First spike at {}: magnitude {:.2} >= threshold {:.2}",
                ts, magnitude, threshold
            );
        } else {
            debug!("Spike at {}: magnitude {:.2} >= {:.2}", ts, magnitude, threshold);
        }
        Some(SpikeEvent {
            timestamp: ts,
            magnitude,
            threshold,
            first,
        })
    }

    /// Threshold the next sample will be compared against.
    pub fn threshold(&self) -> f64 {
        if self.magnitudes.len() < self.settings.window_size {
            return self.settings.fallback_threshold;
        }
        let average = self.magnitudes.iter().sum::<f64>() / self.magnitudes.len() as f64;
        (average * self.settings.spike_multiplier).max(self.settings.minimum_threshold)
    }

    pub fn derivatives(&self) -> &[DerivativeRecord] {
        &self.derivatives
    }

    pub fn trigger_timestamps(&self) -> &[Timestamp] {
        &self.trigger_timestamps
    }

    /// Forget everything, including the previous sample.
    pub fn reset(&mut self) {
        self.previous = None;
        self.magnitudes.clear();
        self.derivatives.clear();
        self.trigger_timestamps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accel(ts: Timestamp, x: f32, y: f32, z: f32) -> SensorSample {
        SensorSample::xyz(Channel::Accel, ts, x, y, z)
    }

    fn settings() -> SpikeSettings {
        SpikeSettings {
            window_size: 5,
            spike_multiplier: 3.0,
            minimum_threshold: 15.0,
            fallback_threshold: 40.0,
        }
    }

    #[test]
    fn derivative_magnitude_is_deterministic() {
        for _ in 0..2 {
            let mut detector = SpikeDetector::new(settings());
            detector.process(&accel(1_000, 1.0, 0.0, 0.0));
            detector.process(&accel(1_100, 1.0, 0.0, 5.0));
            let records = detector.derivatives();
            assert_eq!(records.len(), 1);
            assert!((records[0].magnitude - 50.0).abs() < 1e-9);
            assert!((records[0].dz - 50.0).abs() < 1e-9);
            assert_eq!(records[0].timestamp, 1_100);
        }
    }

    #[test]
    fn fallback_applies_until_window_fills() {
        let mut detector = SpikeDetector::new(settings());
        // Constant derivative magnitude 5.0, well under the fallback.
        let mut z = 0.0f32;
        detector.process(&accel(0, 0.0, 0.0, z));
        for i in 1..=5 {
            z += 0.5;
            assert_eq!(detector.threshold(), 40.0);
            assert!(detector.process(&accel(i * 100, 0.0, 0.0, z)).is_none());
        }
        // Window is full: threshold = max(5 * 3, 15).
        assert!((detector.threshold() - 15.0).abs() < 1e-6);

        // Just under the adaptive threshold.
        z += 1.4;
        assert!(detector.process(&accel(600, 0.0, 0.0, z)).is_none());

        let spike = {
            let mut detector = SpikeDetector::new(settings());
            let mut z = 0.0f32;
            detector.process(&accel(0, 0.0, 0.0, z));
            for i in 1..=5 {
                z += 0.5;
                detector.process(&accel(i * 100, 0.0, 0.0, z));
            }
            z += 2.0;
            let spike = detector.process(&accel(600, 0.0, 0.0, z));
            assert!(detector.process(&accel(700, 0.0, 0.0, z + 0.5)).is_none());
            assert_eq!(detector.trigger_timestamps(), &[600]);
            spike
        };
        let spike = spike.unwrap();
        assert!(spike.first);
        assert!((spike.magnitude - 20.0).abs() < 1e-4);
        assert!(spike.magnitude >= spike.threshold);
    }

    #[test]
    fn fallback_threshold_can_fire_early() {
        let mut detector = SpikeDetector::new(settings());
        detector.process(&accel(0, 0.0, 0.0, 0.0));
        let spike = detector.process(&accel(100, 0.0, 5.0, 0.0)).unwrap();
        assert_eq!(spike.threshold, 40.0);
        let second = detector.process(&accel(200, 0.0, 10.0, 0.0)).unwrap();
        assert!(!second.first);
    }

    #[test]
    fn non_increasing_timestamps_are_skipped() {
        let mut detector = SpikeDetector::new(settings());
        detector.process(&accel(100, 0.0, 0.0, 0.0));
        assert!(detector.process(&accel(100, 9.0, 9.0, 9.0)).is_none());
        assert!(detector.process(&accel(50, 9.0, 9.0, 9.0)).is_none());
        assert!(detector.derivatives().is_empty());

        // The skipped samples did not replace the previous one.
        detector.process(&accel(200, 0.0, 0.0, 1.0));
        assert!((detector.derivatives()[0].magnitude - 10.0).abs() < 1e-9);
    }

    #[test]
    fn window_is_capped_and_reset_clears_logs() {
        let mut detector = SpikeDetector::new(settings());
        detector.process(&accel(0, 0.0, 0.0, 0.0));
        for i in 1..=20 {
            detector.process(&accel(i * 10, 0.0, 0.0, 0.0));
        }
        assert_eq!(detector.magnitudes.len(), 5);
        assert_eq!(detector.derivatives().len(), 20);
        // All-zero window: the absolute minimum still applies.
        assert_eq!(detector.threshold(), 15.0);

        detector.process(&SensorSample::light(500, 10.0));
        assert_eq!(detector.derivatives().len(), 20);

        detector.reset();
        assert!(detector.derivatives().is_empty());
        assert!(detector.trigger_timestamps().is_empty());
        assert_eq!(detector.threshold(), 40.0);
    }
}
