//! Route handlers for drivers, geocoding, and ride tracking.
//!
//! Handlers are thin: parse, call one component, map the error. Success
//! bodies are the plain documented JSON; failures use the error envelope.

use std::str::FromStr;

use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use ridegrid_core::{DriverId, GeoPoint, RequestContext, RideId, RideStatus};

use crate::AppState;
use crate::error::ApiError;
use crate::extract::{JsonBody, QueryParams};

const DEFAULT_NEARBY_RADIUS_M: f64 = 1_000.0;
const DEFAULT_NEARBY_LIMIT: usize = 10;

fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::invalid(format!("invalid {what} id '{raw}'")))
}

/// A bare coordinate pair; `recorded_at` is filled in on receipt.
#[derive(Debug, Deserialize)]
pub struct Coordinates {
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "longitude", alias = "lng")]
    pub lon: f64,
}

// ── Drivers ────────────────────────────────────────────────────

/// PUT /drivers/{driver_id}/location
pub async fn submit_location(
    State(state): State<AppState>,
    Path(driver_id): Path<String>,
    JsonBody(point): JsonBody<GeoPoint>,
) -> Result<Response, ApiError> {
    let driver_id: DriverId = parse_id(&driver_id, "driver")?;
    let accepted = state.pipeline.submit(driver_id, point)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "pending": accepted.pending })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lon: f64,
    #[serde(default = "default_radius")]
    pub radius_m: f64,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_radius() -> f64 {
    DEFAULT_NEARBY_RADIUS_M
}

fn default_limit() -> usize {
    DEFAULT_NEARBY_LIMIT
}

/// GET /drivers/nearby?lat=&lon=&radius_m=&limit=
pub async fn nearby_drivers(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    QueryParams(q): QueryParams<NearbyQuery>,
) -> Result<Response, ApiError> {
    let drivers = state
        .geo
        .nearest_available(&ctx, q.lat, q.lon, q.radius_m, q.limit)
        .await?;
    Ok(Json(json!({ "drivers": drivers })).into_response())
}

/// GET /drivers/{driver_id}/location
pub async fn driver_location(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(driver_id): Path<String>,
) -> Result<Response, ApiError> {
    let driver_id: DriverId = parse_id(&driver_id, "driver")?;
    let point = state.geo.driver_location(&ctx, &driver_id).await?;
    Ok(Json(point).into_response())
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub is_online: bool,
    pub is_available: bool,
    #[serde(default)]
    pub ride_id: Option<RideId>,
}

/// PUT /drivers/{driver_id}/status
pub async fn set_driver_status(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(driver_id): Path<String>,
    JsonBody(body): JsonBody<StatusBody>,
) -> Result<Response, ApiError> {
    let driver_id: DriverId = parse_id(&driver_id, "driver")?;
    state
        .pipeline
        .set_status(&ctx, driver_id, body.is_online, body.is_available, body.ride_id)
        .await?;
    Ok(Json(json!({
        "driver_id": driver_id,
        "is_online": body.is_online,
        "is_available": body.is_available,
        "ride_id": body.ride_id,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// GET /drivers/{driver_id}/history?limit=
pub async fn driver_history(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(driver_id): Path<String>,
    QueryParams(q): QueryParams<HistoryQuery>,
) -> Result<Response, ApiError> {
    let driver_id: DriverId = parse_id(&driver_id, "driver")?;
    let cap = state.settings.history_size.max(1);
    let limit = q.limit.unwrap_or(cap).clamp(1, cap);
    let points = state.geo.history(&ctx, &driver_id, limit).await?;
    Ok(Json(json!({ "driver_id": driver_id, "points": points })).into_response())
}

// ── Geocoding ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ForwardBody {
    pub query: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// POST /geocode/forward
pub async fn geocode_forward(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    JsonBody(body): JsonBody<ForwardBody>,
) -> Result<Response, ApiError> {
    let result = state
        .geocoder
        .forward(&ctx, &body.query, body.region, body.language)
        .await?;
    Ok(Json(result).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ReverseBody {
    #[serde(flatten)]
    pub at: Coordinates,
    #[serde(default)]
    pub language: Option<String>,
}

/// POST /geocode/reverse. May answer with a degraded `"lat,lon"` result.
pub async fn geocode_reverse(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    JsonBody(body): JsonBody<ReverseBody>,
) -> Result<Response, ApiError> {
    let result = state
        .geocoder
        .reverse(&ctx, body.at.lat, body.at.lon, body.language)
        .await?;
    Ok(Json(result).into_response())
}

/// DELETE /geocode/cache
pub async fn invalidate_geocode_cache(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Response, ApiError> {
    let removed = state.geocoder.invalidate_cache(&ctx).await?;
    Ok(Json(json!({ "removed": removed })).into_response())
}

// ── Ride tracking ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StartTrackingBody {
    pub driver_id: DriverId,
    pub destination: Coordinates,
}

/// POST /rides/{ride_id}/tracking
pub async fn start_tracking(
    State(state): State<AppState>,
    Path(ride_id): Path<String>,
    JsonBody(body): JsonBody<StartTrackingBody>,
) -> Result<Response, ApiError> {
    let ride_id: RideId = parse_id(&ride_id, "ride")?;
    let destination = GeoPoint::now(body.destination.lat, body.destination.lon);
    let record = state
        .tracker
        .start_tracking(ride_id, body.driver_id, destination)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(record)).into_response())
}

/// DELETE /rides/{ride_id}/tracking. 204 whether or not the ride was tracked.
pub async fn stop_tracking(
    State(state): State<AppState>,
    Path(ride_id): Path<String>,
) -> Result<Response, ApiError> {
    let ride_id: RideId = parse_id(&ride_id, "ride")?;
    state.tracker.stop_tracking(&ride_id).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// GET /rides/{ride_id}/tracking
pub async fn get_tracking(
    State(state): State<AppState>,
    Path(ride_id): Path<String>,
) -> Result<Response, ApiError> {
    let ride_id: RideId = parse_id(&ride_id, "ride")?;
    match state.tracker.tracking(&ride_id).await {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(ApiError::not_found(format!("ride {ride_id} is not tracked"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct RideStatusBody {
    pub status: RideStatus,
}

/// PUT /rides/{ride_id}/status. Terminal statuses end tracking (204).
pub async fn update_ride_status(
    State(state): State<AppState>,
    Path(ride_id): Path<String>,
    JsonBody(body): JsonBody<RideStatusBody>,
) -> Result<Response, ApiError> {
    let ride_id: RideId = parse_id(&ride_id, "ride")?;
    match state.tracker.update_status(ride_id, body.status).await? {
        Some(record) => Ok(Json(record).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
