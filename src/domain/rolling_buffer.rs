use crate::domain::models::{CompositeDataPoint, SensorSample, Timestamp};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Time-windowed store of composite points, keyed by timestamp.
///
/// A sample landing within `tolerance_ms` of an existing point is merged
/// into the nearest such point; otherwise it opens a new point. So no two
/// points are ever within the tolerance of each other.
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    window_ms: i64,
    tolerance_ms: i64,
    points: BTreeMap<Timestamp, CompositeDataPoint>,
}

impl RollingBuffer {
    pub fn new(window_ms: i64, tolerance_ms: i64) -> Self {
        Self {
            window_ms,
            tolerance_ms: tolerance_ms.max(0),
            points: BTreeMap::new(),
        }
    }

    pub fn ingest(&mut self, sample: &SensorSample) {
        let ts = sample.timestamp;
        match nearest_within(&self.points, ts, self.tolerance_ms) {
            Some(key) => {
                if let Some(point) = self.points.get_mut(&key) {
                    point.apply(sample);
                }
            }
            None => {
                let mut point = CompositeDataPoint::new(ts);
                point.apply(sample);
                self.points.insert(ts, point);
            }
        }
    }

    /// Copy of all points, ordered by timestamp.
    pub fn snapshot(&self) -> Vec<CompositeDataPoint> {
        self.points.values().copied().collect()
    }

    /// Drop every point older than `now - window`. Returns how many went.
    pub fn evict(&mut self, now: Timestamp) -> usize {
        let cutoff = now - self.window_ms;
        let before = self.points.len();
        self.points = self.points.split_off(&cutoff);
        before - self.points.len()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }
}

/// Key of the point closest to `ts` within `tolerance`, if any. Ties go to
/// the earlier point.
pub(crate) fn nearest_within<V>(
    points: &BTreeMap<Timestamp, V>,
    ts: Timestamp,
    tolerance: i64,
) -> Option<Timestamp> {
    let range: RangeInclusive<Timestamp> =
        ts.saturating_sub(tolerance)..=ts.saturating_add(tolerance);
    points
        .range(range)
        .map(|(&key, _)| key)
        .min_by_key(|&key| (key - ts).abs())
}
