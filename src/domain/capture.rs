//! Capture Orchestrator
//!
//! `Idle → Triggered → Finalizing → Idle`. A trigger seeds the session from
//! the rolling buffer snapshot (pre-trigger context), accumulation ticks
//! merge newer points until the planned end, and finalize freezes the
//! session into a [`CaptureBundle`].

use crate::domain::models::{
    CaptureBundle, CompositeDataPoint, DerivativeRecord, Timestamp, TriggerSource,
};
use crate::domain::rolling_buffer::nearest_within;
use crate::domain::settings::{CaptureSettings, LightEdge};
use crate::error::CaptureError;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Edge detector on the light channel. Fires once, then stays quiet until
/// re-armed.
#[derive(Debug, Clone)]
pub struct LightTrigger {
    threshold: f32,
    edge: LightEdge,
    armed: bool,
    last: Option<f32>,
}

impl LightTrigger {
    pub fn new(threshold: f32, edge: LightEdge) -> Self {
        Self {
            threshold,
            edge,
            armed: true,
            last: None,
        }
    }

    /// Feed a light reading. Returns true on an armed threshold crossing.
    /// The very first reading only establishes the baseline.
    pub fn observe(&mut self, lux: f32) -> bool {
        let previous = self.last.replace(lux);
        let Some(previous) = previous else {
            return false;
        };
        let crossed = match self.edge {
            LightEdge::Rising => previous < self.threshold && lux >= self.threshold,
            LightEdge::Falling => previous > self.threshold && lux <= self.threshold,
        };
        if crossed && self.armed {
            self.armed = false;
            return true;
        }
        false
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn rearm(&mut self) {
        self.armed = true;
    }

    /// Re-arm and drop the baseline.
    pub fn reset(&mut self) {
        self.armed = true;
        self.last = None;
    }
}

/// An in-flight capture.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub started_at: Timestamp,
    pub planned_end: Timestamp,
    pub source: TriggerSource,
    points: BTreeMap<Timestamp, CompositeDataPoint>,
}

impl CaptureSession {
    fn new(source: TriggerSource, started_at: Timestamp, duration_ms: i64) -> Self {
        Self {
            started_at,
            planned_end: started_at + duration_ms,
            source,
            points: BTreeMap::new(),
        }
    }

    /// Add `point` unless one is already held within `tolerance`; in that
    /// case only its empty fields are filled. Returns true if a new point
    /// was added.
    fn merge(&mut self, point: &CompositeDataPoint, tolerance: i64) -> bool {
        match nearest_within(&self.points, point.timestamp, tolerance) {
            Some(key) => {
                if let Some(existing) = self.points.get_mut(&key) {
                    existing.fill_missing(point);
                }
                false
            }
            None => {
                self.points.insert(point.timestamp, *point);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum CapturePhase {
    Idle,
    Triggered(CaptureSession),
    Finalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing in progress.
    Idle,
    Accumulating { added: usize },
    /// The planned end has been reached; call `finalize`.
    Due,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub extended_capture_ms: i64,
    pub dedup_tolerance_ms: i64,
    pub light_threshold: f32,
    pub light_edge: LightEdge,
}

impl From<&CaptureSettings> for CaptureConfig {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            extended_capture_ms: settings.extended_capture_ms as i64,
            dedup_tolerance_ms: settings.dedup_tolerance_ms.max(0),
            light_threshold: settings.light_threshold,
            light_edge: settings.light_edge,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureOrchestrator {
    config: CaptureConfig,
    phase: CapturePhase,
    light: LightTrigger,
}

impl CaptureOrchestrator {
    pub fn new(config: CaptureConfig) -> Self {
        let light = LightTrigger::new(config.light_threshold, config.light_edge);
        Self {
            config,
            phase: CapturePhase::Idle,
            light,
        }
    }

    pub fn phase(&self) -> &CapturePhase {
        &self.phase
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, CapturePhase::Idle)
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.phase, CapturePhase::Triggered(_))
    }

    /// Feed a light reading. True when it crossed the threshold on the
    /// configured edge while armed and idle; the caller should then
    /// `trigger` with [`TriggerSource::Light`].
    pub fn observe_light(&mut self, lux: f32) -> bool {
        let fired = self.light.observe(lux);
        if fired && !self.is_idle() {
            debug!("Light edge at {:.1} ignored, capture already running", lux);
            return false;
        }
        fired
    }

    /// Open a capture seeded with `snapshot`. Ignored (returns false) while
    /// another capture is in progress.
    pub fn trigger(
        &mut self,
        source: TriggerSource,
        now: Timestamp,
        snapshot: &[CompositeDataPoint],
    ) -> bool {
        if !self.is_idle() {
            debug!("{:?} trigger ignored, capture already in progress", source);
            return false;
        }
        let mut session = CaptureSession::new(source, now, self.config.extended_capture_ms);
        for point in snapshot {
            session.merge(point, self.config.dedup_tolerance_ms);
        }
        info!(
            "Capture triggered by {:?} at {}, seeded with {} points, ends at {}",
            source,
            now,
            session.len(),
            session.planned_end
        );
        self.light.disarm();
        self.phase = CapturePhase::Triggered(session);
        true
    }

    /// Merge points from a fresh snapshot. Points up to one tolerance
    /// before the start are included: a post-trigger reading may have been
    /// merged into them.
    pub fn tick(&mut self, now: Timestamp, snapshot: &[CompositeDataPoint]) -> TickOutcome {
        let tolerance = self.config.dedup_tolerance_ms;
        let CapturePhase::Triggered(session) = &mut self.phase else {
            return TickOutcome::Idle;
        };

        let start = session.started_at - tolerance;
        let added = snapshot
            .iter()
            .filter(|p| p.timestamp >= start)
            .filter(|p| session.merge(p, tolerance))
            .count();

        if now >= session.planned_end {
            debug!("Capture window closed at {} with {} points", now, session.len());
            TickOutcome::Due
        } else {
            TickOutcome::Accumulating { added }
        }
    }

    /// Freeze the running session. An empty session is an error and goes
    /// straight back to `Idle`; otherwise the orchestrator stays in
    /// `Finalizing` until [`finish`](Self::finish).
    pub fn finalize(
        &mut self,
        derivatives: Vec<DerivativeRecord>,
        trigger_timestamps: Vec<Timestamp>,
    ) -> Result<CaptureBundle, CaptureError> {
        let session = match std::mem::replace(&mut self.phase, CapturePhase::Finalizing) {
            CapturePhase::Triggered(session) => session,
            other => {
                self.phase = other;
                return Err(CaptureError::NotActive);
            }
        };

        if session.is_empty() {
            warn!("Capture started at {} collected no data", session.started_at);
            self.finish();
            return Err(CaptureError::Empty);
        }

        Ok(CaptureBundle {
            started_at: session.started_at,
            planned_end: session.planned_end,
            trigger_source: session.source,
            points: session.points.into_values().collect(),
            derivatives,
            trigger_timestamps,
        })
    }

    /// Hand-off done: back to `Idle` with the light trigger re-armed.
    pub fn finish(&mut self) {
        self.phase = CapturePhase::Idle;
        self.light.rearm();
    }

    /// Abandon any capture and forget the light baseline.
    pub fn reset(&mut self) {
        if self.is_triggered() {
            info!("Discarding in-progress capture");
        }
        self.phase = CapturePhase::Idle;
        self.light.reset();
    }
}
