//! ridegrid-api — HTTP surface of the ridegrid data plane.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | PUT | `/drivers/{driver_id}/location` | Submit a GPS sample (202) |
//! | PUT | `/drivers/{driver_id}/status` | Online / availability / ride assignment |
//! | GET | `/drivers/nearby` | Available drivers near a point |
//! | GET | `/drivers/{driver_id}/location` | Current location (404 once presence lapses) |
//! | GET | `/drivers/{driver_id}/history` | Recent samples, newest first |
//! | POST | `/geocode/forward` | Address to position |
//! | POST | `/geocode/reverse` | Position to address (may be degraded) |
//! | DELETE | `/geocode/cache` | Drop cached geocoding answers |
//! | POST | `/rides/{ride_id}/tracking` | Start ETA tracking (202) |
//! | GET | `/rides/{ride_id}/tracking` | Tracking record |
//! | DELETE | `/rides/{ride_id}/tracking` | Stop ETA tracking (204) |
//! | PUT | `/rides/{ride_id}/status` | Ride status change; terminal stops tracking |
//! | GET | `/healthz` | KV reachability |
//! | GET | `/internal/breakers` | Circuit breaker states |
//! | GET | `/metrics` | Prometheus exposition |
//!
//! Every request runs inside [`middleware::request_context`]; mutating
//! requests with an `Idempotency-Key` also pass [`middleware::idempotency_gate`].

pub mod error;
pub mod extract;
pub mod handlers;
pub mod middleware;
pub mod ops;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post, put};

use ridegrid_cache::{CacheManager, IdempotencyStore};
use ridegrid_core::RidegridConfig;
use ridegrid_eta::EtaTracker;
use ridegrid_geo::GeoQueryService;
use ridegrid_geocode::GeocodingGateway;
use ridegrid_ingest::LocationPipeline;
use ridegrid_resilience::BreakerRegistry;
use ridegrid_state::KvStore;

pub use error::ApiError;

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub request_timeout: Duration,
    /// Upper bound for `/drivers/{id}/history?limit=`.
    pub history_size: usize,
}

impl ApiSettings {
    pub fn from_config(config: &RidegridConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(config.server.request_timeout_ms),
            history_size: config.ingest.history_size,
        }
    }
}

/// Shared state for handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    pub kv: Arc<dyn KvStore>,
    pub pipeline: Arc<LocationPipeline>,
    pub geo: GeoQueryService,
    pub geocoder: Arc<GeocodingGateway>,
    /// Same cache the geocoder writes through; read here for stats.
    pub geocode_cache: CacheManager,
    pub tracker: Arc<EtaTracker>,
    pub idempotency: IdempotencyStore,
    pub breakers: Arc<BreakerRegistry>,
    pub settings: ApiSettings,
}

/// Build the complete router with middleware attached.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/drivers/nearby", get(handlers::nearby_drivers))
        .route(
            "/drivers/{driver_id}/location",
            put(handlers::submit_location).get(handlers::driver_location),
        )
        .route("/drivers/{driver_id}/status", put(handlers::set_driver_status))
        .route("/drivers/{driver_id}/history", get(handlers::driver_history))
        .route("/geocode/forward", post(handlers::geocode_forward))
        .route("/geocode/reverse", post(handlers::geocode_reverse))
        .route("/geocode/cache", axum::routing::delete(handlers::invalidate_geocode_cache))
        .route(
            "/rides/{ride_id}/tracking",
            post(handlers::start_tracking)
                .get(handlers::get_tracking)
                .delete(handlers::stop_tracking),
        )
        .route("/rides/{ride_id}/status", put(handlers::update_ride_status))
        .route("/healthz", get(ops::healthz))
        .route("/internal/breakers", get(ops::breakers))
        .route("/metrics", get(ops::prometheus_metrics))
        .layer(from_fn_with_state(state.clone(), middleware::idempotency_gate))
        .layer(from_fn_with_state(state.clone(), middleware::request_context))
        .with_state(state)
}
