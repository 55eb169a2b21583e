//! Movement classification from raw position samples
//!
//! GPS fixes jitter by a few meters even when the phone sits on a table, so
//! raw displacement cannot be read as travel directly. This module provides
//! the haversine distance primitives and a small stateful classifier that
//! decides whether a sample counts as movement and how long the traveller
//! has been still.

use std::time::Duration;

use tokio::time::Instant;

/// Mean Earth radius in meters, as used by the haversine formula
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Displacement below this is treated as GPS jitter, not travel
pub const MINIMAL_MOVEMENT_METERS: f64 = 15.0;

/// Great-circle distance in meters between two coordinate pairs.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_phi = (lat2 - lat1).to_radians();
    let delta_lambda = (lon2 - lon1).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Distance in meters between two position fixes.
pub fn distance_between(a: &crate::types::PositionFix, b: &crate::types::PositionFix) -> f64 {
    haversine_distance(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Whether a displacement counts as real movement rather than jitter.
pub fn is_movement(distance_meters: f64) -> bool {
    distance_meters >= MINIMAL_MOVEMENT_METERS
}

/// Stateful movement classifier for a single monitored journey.
///
/// The classifier anchors at the last position that counted as movement and
/// measures every new sample against that anchor, so slow travel accumulates
/// across samples instead of hiding below the jitter threshold. The first
/// sample establishes the anchor and counts as movement.
#[derive(Debug)]
pub struct MovementClassifier {
    min_movement_meters: f64,
    anchor: Option<(f64, f64)>,
    last_movement: Instant,
}

impl MovementClassifier {
    /// Create a classifier with movement last seen at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            min_movement_meters: MINIMAL_MOVEMENT_METERS,
            anchor: None,
            last_movement: now,
        }
    }

    pub fn with_min_movement(mut self, meters: f64) -> Self {
        self.min_movement_meters = meters;
        self
    }

    /// Feed a position sample. Returns true when the sample counts as
    /// movement, in which case the anchor and last-movement time advance.
    pub fn observe(&mut self, latitude: f64, longitude: f64, at: Instant) -> bool {
        let moved = match self.anchor {
            None => true,
            Some((lat, lon)) => {
                haversine_distance(lat, lon, latitude, longitude) >= self.min_movement_meters
            }
        };
        if moved {
            self.anchor = Some((latitude, longitude));
            self.last_movement = at;
        }
        moved
    }

    /// Treat `at` as a movement signal without a position sample. Used by the
    /// manual override path where the shell asserts the traveller is moving.
    pub fn mark_movement(&mut self, at: Instant) {
        self.last_movement = at;
    }

    /// How long the traveller has been still, as of `now`.
    pub fn stationary_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_movement)
    }

    /// Whether the stationary duration has reached `threshold`.
    pub fn is_stationary(&self, now: Instant, threshold: Duration) -> bool {
        self.stationary_for(now) >= threshold
    }
}
