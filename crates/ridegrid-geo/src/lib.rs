//! ridegrid-geo — read side of the driver location data.
//!
//! [`GeoQueryService`] answers "who is near this point" from the geo index
//! and "where is this driver" from the TTL-bounded presence record. ETAs go
//! through an [`EtaEstimator`]: the calibrated heuristic by default, or an
//! external model behind a circuit breaker.

pub mod error;
pub mod estimator;
pub mod service;

pub use error::{GeoError, GeoResult};
pub use estimator::{EtaEstimator, HeuristicEstimator, HttpEtaEstimator, ML_ETA_BREAKER};
pub use service::{GeoQueryService, NearbyDriver, MAX_NEARBY_LIMIT, MAX_RADIUS_M};
