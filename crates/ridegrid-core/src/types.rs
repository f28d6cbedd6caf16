//! Domain types shared across ridegrid crates.
//!
//! These records travel by value between components: through the KV store
//! (JSON-encoded), through in-process channels, and over the HTTP surface.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a driver.
    DriverId
);
uuid_id!(
    /// Identifier of a rider.
    RiderId
);
uuid_id!(
    /// Identifier of a ride.
    RideId
);

// ── GeoPoint ───────────────────────────────────────────────────────

/// A single GPS sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lon", alias = "lng")]
    pub longitude: f64,
    /// Degrees clockwise from north, `[0, 360)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Meters per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Horizontal accuracy radius in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// Reasons a sample fails validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PointError {
    #[error("latitude {0} outside [-90, 90]")]
    Latitude(f64),

    #[error("longitude {0} outside [-180, 180]")]
    Longitude(f64),

    #[error("heading {0} outside [0, 360)")]
    Heading(f64),

    #[error("speed {0} is negative")]
    Speed(f64),

    #[error("accuracy {got}m exceeds limit {limit}m")]
    Accuracy { got: f64, limit: f64 },

    #[error("{0} is not a finite number")]
    NotFinite(&'static str),
}

impl GeoPoint {
    /// A bare position recorded at `recorded_at`.
    pub fn new(latitude: f64, longitude: f64, recorded_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            heading: None,
            speed: None,
            accuracy: None,
            recorded_at,
        }
    }

    /// A bare position stamped with the current time.
    pub fn now(latitude: f64, longitude: f64) -> Self {
        Self::new(latitude, longitude, Utc::now())
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    /// Check range bounds and finiteness. `max_accuracy` caps the optional
    /// accuracy field when set.
    pub fn validate(&self, max_accuracy: Option<f64>) -> Result<(), PointError> {
        if !self.latitude.is_finite() {
            return Err(PointError::NotFinite("latitude"));
        }
        if !self.longitude.is_finite() {
            return Err(PointError::NotFinite("longitude"));
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(PointError::Latitude(self.latitude));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(PointError::Longitude(self.longitude));
        }
        if let Some(heading) = self.heading {
            if !heading.is_finite() {
                return Err(PointError::NotFinite("heading"));
            }
            if !(0.0..360.0).contains(&heading) {
                return Err(PointError::Heading(heading));
            }
        }
        if let Some(speed) = self.speed {
            if !speed.is_finite() {
                return Err(PointError::NotFinite("speed"));
            }
            if speed < 0.0 {
                return Err(PointError::Speed(speed));
            }
        }
        if let Some(accuracy) = self.accuracy {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err(PointError::NotFinite("accuracy"));
            }
            if let Some(limit) = max_accuracy {
                if accuracy > limit {
                    return Err(PointError::Accuracy {
                        got: accuracy,
                        limit,
                    });
                }
            }
        }
        Ok(())
    }
}

// ── Presence ───────────────────────────────────────────────────────

/// Where a driver is right now. TTL-bounded in the KV store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverPresence {
    pub driver_id: DriverId,
    pub last_point: GeoPoint,
    pub last_seen: DateTime<Utc>,
    pub is_online: bool,
    pub is_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<RideId>,
}

impl DriverPresence {
    /// Whether the driver belongs in the geo index.
    pub fn dispatchable(&self) -> bool {
        self.is_online && self.is_available
    }
}

/// A sample bound to its driver, as handed to the durable sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub driver_id: DriverId,
    pub point: GeoPoint,
}

impl LocationSample {
    /// Composite key for durable storage: `{driver_id}:{recorded_at_ms:020}`.
    pub fn table_key(&self) -> String {
        format!(
            "{}:{:020}",
            self.driver_id,
            self.point.recorded_at.timestamp_millis().max(0)
        )
    }
}

// ── Ride tracking ──────────────────────────────────────────────────

/// Lifecycle of a tracked ride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    PickingUp,
    EnRoute,
    Arrived,
    Completed,
    Cancelled,
    /// Driver location went missing for too many ticks; no longer scheduled.
    StaleTracking,
}

impl RideStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// Whether the tracker keeps recomputing ETA in this status.
    pub fn is_tracked(&self) -> bool {
        matches!(
            self,
            RideStatus::PickingUp | RideStatus::EnRoute | RideStatus::Arrived
        )
    }
}

/// ETA tracking state for one active ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideTracking {
    pub ride_id: RideId,
    pub driver_id: DriverId,
    pub destination: GeoPoint,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_eta_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_eta_computed_at: Option<DateTime<Utc>>,
    pub status: RideStatus,
    pub missed_ticks: u32,
}

/// Payload pushed to the real-time channel on every ETA publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtaUpdate {
    pub ride_id: RideId,
    pub driver_point: GeoPoint,
    pub destination: GeoPoint,
    pub eta_secs: f64,
    pub computed_at: DateTime<Utc>,
}

// ── Geocoding ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeocodeKind {
    Forward,
    Reverse,
}

impl GeocodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeocodeKind::Forward => "forward",
            GeocodeKind::Reverse => "reverse",
        }
    }
}

/// What is being geocoded: free text (forward) or a position (reverse).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeocodeQuery {
    Text(String),
    Point { lat: f64, lon: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeRequest {
    pub kind: GeocodeKind,
    pub query: GeocodeQuery,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl GeocodeRequest {
    pub fn forward(query: impl Into<String>, region: Option<String>, language: Option<String>) -> Self {
        Self {
            kind: GeocodeKind::Forward,
            query: GeocodeQuery::Text(query.into()),
            region,
            language,
        }
    }

    pub fn reverse(lat: f64, lon: f64, language: Option<String>) -> Self {
        Self {
            kind: GeocodeKind::Reverse,
            query: GeocodeQuery::Point { lat, lon },
            region: None,
            language,
        }
    }

    /// The cache fingerprint input: `(kind, normalized_query, region, language)`
    /// joined with `|`. Text is trimmed, lowercased and whitespace-collapsed;
    /// points are rounded to 6 decimal places (~0.1m).
    pub fn fingerprint_input(&self) -> String {
        let query = match &self.query {
            GeocodeQuery::Text(text) => normalize_query(text),
            GeocodeQuery::Point { lat, lon } => format!("{lat:.6},{lon:.6}"),
        };
        let region = self
            .region
            .as_deref()
            .map(normalize_query)
            .unwrap_or_default();
        let language = self
            .language
            .as_deref()
            .map(normalize_query)
            .unwrap_or_default();
        format!("{}|{query}|{region}|{language}", self.kind.as_str())
    }
}

/// Trim, lowercase, and collapse internal whitespace runs to one space.
pub fn normalize_query(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub formatted_address: String,
    pub point: GeoPoint,
    pub components: BTreeMap<String, String>,
    pub provider: String,
    pub cached: bool,
}

impl GeocodeResult {
    /// Provider label used for synthesized results.
    pub const DEGRADED_PROVIDER: &'static str = "degraded";

    /// Synthesized reverse-geocode answer used when the provider is unavailable.
    pub fn degraded_reverse(lat: f64, lon: f64) -> Self {
        Self {
            formatted_address: format!("{lat},{lon}"),
            point: GeoPoint::now(lat, lon),
            components: BTreeMap::new(),
            provider: Self::DEGRADED_PROVIDER.to_string(),
            cached: false,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.provider == Self::DEGRADED_PROVIDER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn ids_parse_and_display() {
        let id = DriverId::new();
        let parsed: DriverId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<RideId>().is_err());
    }

    #[test]
    fn valid_point_passes() {
        let p = GeoPoint::new(37.7749, -122.4194, ts(10))
            .with_speed(3.0)
            .with_heading(359.9)
            .with_accuracy(5.0);
        assert!(p.validate(Some(50.0)).is_ok());
    }

    #[test]
    fn out_of_range_points_rejected() {
        assert_eq!(
            GeoPoint::new(91.0, 0.0, ts(0)).validate(None),
            Err(PointError::Latitude(91.0))
        );
        assert_eq!(
            GeoPoint::new(0.0, -180.5, ts(0)).validate(None),
            Err(PointError::Longitude(-180.5))
        );
        assert_eq!(
            GeoPoint::new(0.0, 0.0, ts(0)).with_heading(360.0).validate(None),
            Err(PointError::Heading(360.0))
        );
        assert_eq!(
            GeoPoint::new(0.0, 0.0, ts(0)).with_speed(-1.0).validate(None),
            Err(PointError::Speed(-1.0))
        );
    }

    #[test]
    fn nan_rejected() {
        let p = GeoPoint::new(f64::NAN, 0.0, ts(0));
        assert_eq!(p.validate(None), Err(PointError::NotFinite("latitude")));
    }

    #[test]
    fn accuracy_limit_applies_only_when_configured() {
        let p = GeoPoint::new(0.0, 0.0, ts(0)).with_accuracy(120.0);
        assert!(p.validate(None).is_ok());
        assert!(matches!(
            p.validate(Some(100.0)),
            Err(PointError::Accuracy { .. })
        ));
    }

    #[test]
    fn point_accepts_short_field_names() {
        let json = r#"{"lat": 1.5, "lon": 2.5, "recorded_at": "2024-01-01T00:00:00Z"}"#;
        let p: GeoPoint = serde_json::from_str(json).unwrap();
        assert_eq!(p.latitude, 1.5);
        assert_eq!(p.longitude, 2.5);
        assert!(p.speed.is_none());
    }

    #[test]
    fn sample_key_sorts_by_time() {
        let driver = DriverId::new();
        let a = LocationSample {
            driver_id: driver,
            point: GeoPoint::new(0.0, 0.0, ts(9)),
        };
        let b = LocationSample {
            driver_id: driver,
            point: GeoPoint::new(0.0, 0.0, ts(10)),
        };
        assert!(a.table_key() < b.table_key());
        assert!(a.table_key().starts_with(&driver.to_string()));
    }

    #[test]
    fn ride_status_serializes_snake_case() {
        let json = serde_json::to_string(&RideStatus::PickingUp).unwrap();
        assert_eq!(json, "\"picking_up\"");
        assert!(RideStatus::Completed.is_terminal());
        assert!(!RideStatus::StaleTracking.is_tracked());
    }

    #[test]
    fn query_normalization() {
        assert_eq!(normalize_query("  1 Market   St\tSF "), "1 market st sf");
        let a = GeocodeRequest::forward("1 Market St", Some("US".into()), None);
        let b = GeocodeRequest::forward("  1  MARKET st ", Some("us".into()), None);
        assert_eq!(a.fingerprint_input(), b.fingerprint_input());
        let c = GeocodeRequest::forward("1 Market St", None, None);
        assert_ne!(a.fingerprint_input(), c.fingerprint_input());
    }

    #[test]
    fn reverse_fingerprint_differs_from_forward() {
        let r = GeocodeRequest::reverse(1.0, 2.0, None);
        assert!(r.fingerprint_input().starts_with("reverse|1.000000,2.000000"));
    }

    #[test]
    fn degraded_reverse_shape() {
        let r = GeocodeResult::degraded_reverse(37.5, -122.25);
        assert_eq!(r.formatted_address, "37.5,-122.25");
        assert!(r.components.is_empty());
        assert!(r.is_degraded());
        assert!(!r.cached);
    }

    fn round_trip<T>(value: &T) -> T
    where
        T: Serialize + serde::de::DeserializeOwned,
    {
        serde_json::from_str(&serde_json::to_string(value).unwrap()).unwrap()
    }

    #[test]
    fn point_keeps_optional_fields_through_json() {
        let p = GeoPoint::new(37.75, -122.5, ts(60))
            .with_heading(270.0)
            .with_speed(12.5)
            .with_accuracy(8.0);
        assert_eq!(round_trip(&p), p);

        let bare = GeoPoint::new(1.0, 2.0, ts(0));
        let json = serde_json::to_string(&bare).unwrap();
        assert!(!json.contains("heading"));
        assert_eq!(round_trip(&bare), bare);
    }

    #[test]
    fn geocode_result_keeps_components_through_json() {
        let result = GeocodeResult {
            formatted_address: "1 Market St, San Francisco".to_string(),
            point: GeoPoint::new(37.75, -122.375, ts(5)),
            components: BTreeMap::from([
                ("city".to_string(), "San Francisco".to_string()),
                ("postal_code".to_string(), "94105".to_string()),
                ("street".to_string(), "Market St".to_string()),
            ]),
            provider: "maps".to_string(),
            cached: true,
        };
        let back = round_trip(&result);
        assert_eq!(back, result);
        assert_eq!(back.components.get("postal_code").map(String::as_str), Some("94105"));
    }

    #[test]
    fn presence_keeps_ride_binding_through_json() {
        let mut presence = DriverPresence {
            driver_id: DriverId::new(),
            last_point: GeoPoint::new(10.0, 20.0, ts(30)).with_speed(4.0),
            last_seen: ts(30),
            is_online: true,
            is_available: false,
            ride_id: Some(RideId::new()),
        };
        assert_eq!(round_trip(&presence), presence);

        presence.ride_id = None;
        presence.is_available = true;
        let back = round_trip(&presence);
        assert_eq!(back, presence);
        assert!(back.dispatchable());
    }

    #[test]
    fn tracking_keeps_last_eta_through_json() {
        let mut tracking = RideTracking {
            ride_id: RideId::new(),
            driver_id: DriverId::new(),
            destination: GeoPoint::new(-33.875, 151.25, ts(0)),
            started_at: ts(100),
            last_eta_secs: Some(420.5),
            last_eta_computed_at: Some(ts(160)),
            status: RideStatus::PickingUp,
            missed_ticks: 2,
        };
        assert_eq!(round_trip(&tracking), tracking);

        tracking.last_eta_secs = None;
        tracking.last_eta_computed_at = None;
        tracking.status = RideStatus::StaleTracking;
        let json = serde_json::to_string(&tracking).unwrap();
        assert!(!json.contains("last_eta_secs"));
        assert_eq!(round_trip(&tracking), tracking);
    }
}
