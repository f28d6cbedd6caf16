//! Great-circle distance and the heuristic ETA model.
//!
//! `heuristic_eta` is a pure function of its inputs: the origin's reported
//! speed (when trustworthy) or a time-of-day band from the calibration
//! table, applied to the haversine distance.

use std::time::Duration;

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use crate::types::GeoPoint;

/// Mean Earth radius in meters (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Reported speeds below this are treated as GPS noise.
pub const MIN_OBSERVED_SPEED_MPS: f64 = 0.5;

/// Great-circle distance between two positions in meters.
pub fn haversine_distance(a: &GeoPoint, b: &GeoPoint) -> f64 {
    haversine_m(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Coordinate form of [`haversine_distance`].
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// One row of the speed calibration table: hours `[start_hour, end_hour]`
/// (inclusive, UTC) travel at `speed_mps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedBand {
    pub start_hour: u32,
    pub end_hour: u32,
    pub speed_mps: f64,
}

/// Time-of-day speed calibration used when no trustworthy observed speed exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedProfile {
    pub bands: Vec<SpeedBand>,
    /// Used for hours no band covers.
    pub fallback_mps: f64,
}

impl Default for SpeedProfile {
    fn default() -> Self {
        let band = |start_hour, end_hour, speed_mps| SpeedBand {
            start_hour,
            end_hour,
            speed_mps,
        };
        Self {
            bands: vec![
                band(0, 5, 11.0),
                band(6, 9, 6.0),
                band(10, 15, 8.0),
                band(16, 19, 6.0),
                band(20, 23, 11.0),
            ],
            fallback_mps: 8.0,
        }
    }
}

impl SpeedProfile {
    /// A profile that always answers `speed_mps`.
    pub fn constant(speed_mps: f64) -> Self {
        Self {
            bands: Vec::new(),
            fallback_mps: speed_mps,
        }
    }

    /// Calibrated speed for an hour of day.
    pub fn speed_for_hour(&self, hour: u32) -> f64 {
        self.bands
            .iter()
            .find(|b| (b.start_hour..=b.end_hour).contains(&hour))
            .map(|b| b.speed_mps)
            .unwrap_or(self.fallback_mps)
    }

    /// Observed speed when above the noise floor, else the calibrated band.
    pub fn effective_speed(&self, observed: Option<f64>, hour: u32) -> f64 {
        match observed {
            Some(v) if v.is_finite() && v >= MIN_OBSERVED_SPEED_MPS => v,
            _ => self.speed_for_hour(hour),
        }
    }
}

/// `haversine_distance(a, b) / effective_speed`, where the speed comes from
/// `a.speed` or the profile band for `a.recorded_at`'s hour.
pub fn heuristic_eta(a: &GeoPoint, b: &GeoPoint, profile: &SpeedProfile) -> Duration {
    let distance = haversine_distance(a, b);
    let speed = profile.effective_speed(a.speed, a.recorded_at.hour());
    if speed <= 0.0 || !speed.is_finite() {
        return Duration::MAX;
    }
    Duration::try_from_secs_f64(distance / speed).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at_hour(lat: f64, lon: f64, hour: u32) -> GeoPoint {
        GeoPoint::new(
            lat,
            lon,
            Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).single().unwrap(),
        )
    }

    #[test]
    fn tiny_band_speed_saturates() {
        let profile = SpeedProfile::constant(f64::MIN_POSITIVE);
        let a = at_hour(0.0, 0.0, 12);
        let b = at_hour(0.0, 0.01, 12);
        assert_eq!(heuristic_eta(&a, &b, &profile), Duration::MAX);
    }

    #[test]
    fn zero_distance() {
        let p = at_hour(10.0, 10.0, 12);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn short_urban_hop() {
        let a = at_hour(37.7749, -122.4194, 12);
        let b = at_hour(37.7750, -122.4195, 12);
        let d = haversine_distance(&a, &b);
        assert!((d - 14.1).abs() < 1.0, "got {d}");
    }

    #[test]
    fn equator_hundredth_degree() {
        let a = at_hour(0.0, 0.0, 12);
        let b = at_hour(0.0, 0.01, 12);
        let d = haversine_distance(&a, &b);
        assert!((d - 1111.95).abs() < 0.5, "got {d}");
    }

    #[test]
    fn distance_is_symmetric() {
        let a = at_hour(51.5, -0.12, 0);
        let b = at_hour(48.85, 2.35, 0);
        let ab = haversine_distance(&a, &b);
        let ba = haversine_distance(&b, &a);
        assert!((ab - ba).abs() < 1e-6);
        assert!((ab - 343_500.0).abs() < 2_000.0, "got {ab}");
    }

    #[test]
    fn observed_speed_wins_over_profile() {
        let a = at_hour(0.0, 0.0, 12).with_speed(10.0);
        let b = at_hour(0.0, 0.01, 12);
        let eta = heuristic_eta(&a, &b, &SpeedProfile::default());
        assert!((eta.as_secs_f64() - 111.2).abs() < 0.5, "got {eta:?}");
    }

    #[test]
    fn noise_speed_falls_back_to_band() {
        let profile = SpeedProfile::default();
        assert_eq!(profile.effective_speed(Some(0.1), 7), 6.0);
        assert_eq!(profile.effective_speed(None, 2), 11.0);
        assert_eq!(profile.effective_speed(Some(f64::NAN), 12), 8.0);
    }

    #[test]
    fn constant_profile() {
        let profile = SpeedProfile::constant(5.0);
        for hour in 0..24 {
            assert_eq!(profile.speed_for_hour(hour), 5.0);
        }
    }

    #[test]
    fn zero_speed_profile_yields_max() {
        let a = at_hour(0.0, 0.0, 12);
        let b = at_hour(0.0, 0.01, 12);
        assert_eq!(heuristic_eta(&a, &b, &SpeedProfile::constant(0.0)), Duration::MAX);
    }
}
