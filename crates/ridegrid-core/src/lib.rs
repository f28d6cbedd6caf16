//! ridegrid-core — shared vocabulary for the ridegrid data plane.
//!
//! Everything here is pure: identifiers and domain records, the geo math
//! the query and ETA paths share, the error taxonomy every crate maps its
//! own errors onto, the per-request context (correlation id, deadline,
//! cancellation), and the TOML configuration model.
//!
//! # Crate map
//!
//! ```text
//! ridegrid-core
//!   ├── types    DriverId/RideId, GeoPoint, DriverPresence, RideTracking, geocode records
//!   ├── geo      haversine distance, speed profile, heuristic ETA
//!   ├── error    ErrorKind (InvalidInput … Cancelled)
//!   ├── context  RequestContext: request id + deadline + cancellation
//!   └── config   RidegridConfig (ridegrid.toml)
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod geo;
pub mod types;

pub use config::RidegridConfig;
pub use context::{Interrupted, RequestContext};
pub use error::ErrorKind;
pub use geo::{haversine_distance, heuristic_eta, SpeedProfile};
pub use types::*;
