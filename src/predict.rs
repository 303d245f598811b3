//! Position Predictor
//!
//! Dead-reckoning between real telemetry updates: keeps a short position
//! history per device and extrapolates where the device should be after
//! `delta_ms` with no new observation.
//!
//! # Algorithm
//!
//! ```text
//! speed   = distance(prev, last) / Δt(prev, last)
//! heading = bearing(prev, last)
//! next    = project(last, heading, speed * delta_t)
//! ```
//!
//! Zero speed means the device is parked: the last known position is
//! returned unchanged rather than projecting noise. Fewer than two
//! samples means no motion vector exists and prediction yields nothing.
//!
//! History is a fixed-capacity ring (3 slots, oldest evicted first), not
//! a growable list: updates arrive at high frequency and the history
//! never needs more than the last motion segment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

use crate::geo::{self, GeoPoint};

/// Samples retained per device.
const HISTORY_CAPACITY: usize = 3;

/// Configuration for position prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    /// Enable dead-reckoning between real updates
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Stop extrapolating once the last fix is older than this (ms);
    /// a stalled feed must not march the marker off into the distance
    #[serde(default = "default_horizon_ms")]
    pub horizon_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_horizon_ms() -> u64 {
    5000
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            horizon_ms: default_horizon_ms(),
        }
    }
}

/// A single position observation. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    /// Observed coordinate
    pub position: GeoPoint,
    /// Reported ground speed in m/s, if any
    pub speed: Option<f64>,
    /// Reported course over ground in degrees, if any
    pub course: Option<f64>,
    /// Observation time
    pub timestamp: DateTime<Utc>,
}

impl PositionSample {
    /// Create a sample with an explicit timestamp.
    pub fn new(position: GeoPoint, timestamp: DateTime<Utc>) -> Self {
        Self {
            position,
            speed: None,
            course: None,
            timestamp,
        }
    }

    /// Attach a reported speed (m/s).
    pub fn with_speed(mut self, speed: Option<f64>) -> Self {
        self.speed = speed;
        self
    }

    /// Attach a reported course (degrees).
    pub fn with_course(mut self, course: Option<f64>) -> Self {
        self.course = course;
        self
    }
}

/// Fixed-capacity sample ring: arena + write index, no reallocation.
#[derive(Debug, Default)]
struct SampleRing {
    slots: [Option<PositionSample>; HISTORY_CAPACITY],
    head: usize,
    len: usize,
}

impl SampleRing {
    fn push(&mut self, sample: PositionSample) {
        self.slots[self.head] = Some(sample);
        self.head = (self.head + 1) % HISTORY_CAPACITY;
        self.len = (self.len + 1).min(HISTORY_CAPACITY);
    }

    fn len(&self) -> usize {
        self.len
    }

    /// Sample at `age` steps back from the newest (0 = newest).
    fn back(&self, age: usize) -> Option<&PositionSample> {
        if age >= self.len {
            return None;
        }
        let idx = (self.head + HISTORY_CAPACITY - 1 - age) % HISTORY_CAPACITY;
        self.slots[idx].as_ref()
    }
}

/// Per-device dead-reckoning state.
#[derive(Debug, Default)]
pub struct PositionPredictor {
    history: HashMap<String, SampleRing>,
}

impl PositionPredictor {
    /// Create an empty predictor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample to a device's history (oldest evicted at capacity).
    pub fn add_position(&mut self, device_id: &str, sample: PositionSample) {
        let ring = self.history.entry(device_id.to_owned()).or_default();
        ring.push(sample);
        trace!(
            device_id,
            samples = ring.len(),
            position = %sample.position,
            "position sample recorded"
        );
    }

    /// Number of samples held for a device.
    pub fn sample_count(&self, device_id: &str) -> usize {
        self.history.get(device_id).map_or(0, SampleRing::len)
    }

    /// Last recorded position for a device, if any.
    pub fn last_position(&self, device_id: &str) -> Option<GeoPoint> {
        self.history
            .get(device_id)?
            .back(0)
            .map(|sample| sample.position)
    }

    /// Extrapolate a device's position `delta_ms` past its last sample.
    ///
    /// Returns `None` with fewer than two samples (no motion vector) or
    /// when the last two samples share a timestamp.
    pub fn predict_next(&self, device_id: &str, delta_ms: u64) -> Option<GeoPoint> {
        let ring = self.history.get(device_id)?;
        let last = ring.back(0)?;
        let prev = ring.back(1)?;

        let dt_ms = (last.timestamp - prev.timestamp).num_milliseconds();
        if dt_ms <= 0 {
            return None;
        }

        let travelled = geo::distance(&prev.position, &last.position);
        let speed = travelled / (dt_ms as f64 / 1000.0);

        // Parked device: hold the last fix instead of projecting noise
        if speed == 0.0 {
            return Some(last.position);
        }

        let heading = geo::bearing(&prev.position, &last.position);
        let ahead_m = speed * (delta_ms as f64 / 1000.0);
        let predicted = geo::destination(&last.position, heading, ahead_m);

        trace!(
            device_id,
            speed_ms = speed,
            heading,
            ahead_m,
            predicted = %predicted,
            "dead-reckoned position"
        );

        Some(predicted)
    }

    /// Drop one device's history (device context changed, e.g. the
    /// channel disconnected).
    pub fn clear(&mut self, device_id: &str) {
        self.history.remove(device_id);
    }

    /// Drop all history.
    pub fn clear_all(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + offset_ms)
            .unwrap()
    }

    #[test]
    fn test_no_prediction_without_two_samples() {
        let mut predictor = PositionPredictor::new();
        assert_eq!(predictor.predict_next("dev", 1000), None);

        predictor.add_position("dev", PositionSample::new(GeoPoint::new(0.0, 0.0), ts(0)));
        assert_eq!(predictor.predict_next("dev", 1000), None);
    }

    #[test]
    fn test_prediction_continues_along_bearing() {
        let mut predictor = PositionPredictor::new();
        predictor.add_position("dev", PositionSample::new(GeoPoint::new(0.0, 0.0), ts(0)));
        predictor.add_position(
            "dev",
            PositionSample::new(GeoPoint::new(0.0, 0.001), ts(1000)),
        );

        let predicted = predictor.predict_next("dev", 1000).unwrap();

        // Same speed, same bearing: one more step of ~0.001 degrees east
        assert!(predicted.latitude.abs() < 1e-6, "lat {}", predicted.latitude);
        assert!(
            (predicted.longitude - 0.002).abs() < 1e-5,
            "lon {}",
            predicted.longitude
        );
    }

    #[test]
    fn test_zero_speed_holds_last_position() {
        let mut predictor = PositionPredictor::new();
        let parked = GeoPoint::new(48.137, 11.576);
        predictor.add_position("dev", PositionSample::new(parked, ts(0)));
        predictor.add_position("dev", PositionSample::new(parked, ts(1000)));

        assert_eq!(predictor.predict_next("dev", 5000), Some(parked));
    }

    #[test]
    fn test_identical_timestamps_yield_none() {
        let mut predictor = PositionPredictor::new();
        predictor.add_position("dev", PositionSample::new(GeoPoint::new(0.0, 0.0), ts(0)));
        predictor.add_position("dev", PositionSample::new(GeoPoint::new(0.0, 0.001), ts(0)));

        assert_eq!(predictor.predict_next("dev", 1000), None);
    }

    #[test]
    fn test_history_evicts_oldest_at_capacity() {
        let mut predictor = PositionPredictor::new();
        for i in 0..5 {
            predictor.add_position(
                "dev",
                PositionSample::new(GeoPoint::new(0.0, i as f64 * 0.001), ts(i * 1000)),
            );
        }

        assert_eq!(predictor.sample_count("dev"), 3);
        // Newest survives, prediction uses the last pair
        assert_eq!(
            predictor.last_position("dev"),
            Some(GeoPoint::new(0.0, 0.004))
        );
        let predicted = predictor.predict_next("dev", 1000).unwrap();
        assert!((predicted.longitude - 0.005).abs() < 1e-5);
    }

    #[test]
    fn test_devices_are_isolated() {
        let mut predictor = PositionPredictor::new();
        predictor.add_position("a", PositionSample::new(GeoPoint::new(0.0, 0.0), ts(0)));
        predictor.add_position("a", PositionSample::new(GeoPoint::new(0.0, 0.001), ts(1000)));
        predictor.add_position("b", PositionSample::new(GeoPoint::new(50.0, 8.0), ts(0)));

        assert!(predictor.predict_next("a", 1000).is_some());
        assert_eq!(predictor.predict_next("b", 1000), None);

        predictor.clear("a");
        assert_eq!(predictor.sample_count("a"), 0);
        assert_eq!(predictor.sample_count("b"), 1);
    }
}
