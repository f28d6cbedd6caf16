//! GeoQueryService — nearest drivers, current location, recent history.
//!
//! Reads only. The geo index and presence records are written by the
//! ingest pipeline; results here are snapshots of the index at read time,
//! and a driver may go offline between the read and dispatch.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use ridegrid_core::{DriverId, DriverPresence, GeoPoint, RequestContext};
use ridegrid_state::{KeySpace, KvStore};

use crate::error::{GeoError, GeoResult};
use crate::estimator::EtaEstimator;

/// Largest radius a nearby query may ask for.
pub const MAX_RADIUS_M: f64 = 50_000.0;
pub const MAX_NEARBY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyDriver {
    pub driver_id: DriverId,
    pub distance_m: f64,
}

#[derive(Clone)]
pub struct GeoQueryService {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    estimator: Arc<dyn EtaEstimator>,
}

impl GeoQueryService {
    pub fn new(kv: Arc<dyn KvStore>, keys: KeySpace, estimator: Arc<dyn EtaEstimator>) -> Self {
        Self { kv, keys, estimator }
    }

    /// Available drivers within `radius_m`, nearest first.
    pub async fn nearest_available(
        &self,
        ctx: &RequestContext,
        lat: f64,
        lon: f64,
        radius_m: f64,
        limit: usize,
    ) -> GeoResult<Vec<NearbyDriver>> {
        GeoPoint::now(lat, lon)
            .validate(None)
            .map_err(|e| GeoError::InvalidInput(e.to_string()))?;
        if !radius_m.is_finite() || radius_m <= 0.0 || radius_m > MAX_RADIUS_M {
            return Err(GeoError::InvalidInput(format!(
                "radius_m must be in (0, {MAX_RADIUS_M}]"
            )));
        }
        if limit == 0 || limit > MAX_NEARBY_LIMIT {
            return Err(GeoError::InvalidInput(format!(
                "limit must be in [1, {MAX_NEARBY_LIMIT}]"
            )));
        }

        let hits = self
            .kv
            .geo_radius(ctx, &self.keys.geo_index(), lat, lon, radius_m, limit)
            .await?;
        let drivers: Vec<NearbyDriver> = hits
            .into_iter()
            .filter_map(|hit| match hit.member.parse::<DriverId>() {
                Ok(driver_id) => Some(NearbyDriver {
                    driver_id,
                    distance_m: hit.distance_m,
                }),
                Err(_) => {
                    warn!(member = %hit.member, "ignoring malformed geo index member");
                    None
                }
            })
            .collect();
        debug!(lat, lon, radius_m, found = drivers.len(), "nearby query");
        Ok(drivers)
    }

    /// Full presence record, or `NotFound` once its TTL has lapsed.
    pub async fn presence(&self, ctx: &RequestContext, driver_id: &DriverId) -> GeoResult<DriverPresence> {
        let raw = self
            .kv
            .get_bytes(ctx, &self.keys.presence(driver_id))
            .await?
            .ok_or(GeoError::NotFound(*driver_id))?;
        serde_json::from_slice(&raw).map_err(|e| GeoError::Decode(e.to_string()))
    }

    pub async fn driver_location(&self, ctx: &RequestContext, driver_id: &DriverId) -> GeoResult<GeoPoint> {
        self.presence(ctx, driver_id).await.map(|p| p.last_point)
    }

    /// Recent samples from the capped history list, newest first.
    pub async fn history(&self, ctx: &RequestContext, driver_id: &DriverId, limit: usize) -> GeoResult<Vec<GeoPoint>> {
        let raw = self
            .kv
            .list_range(ctx, &self.keys.history(driver_id), limit)
            .await?;
        raw.iter()
            .map(|entry| serde_json::from_slice(entry).map_err(|e| GeoError::Decode(e.to_string())))
            .collect()
    }

    pub async fn eta(&self, ctx: &RequestContext, origin: &GeoPoint, destination: &GeoPoint) -> Duration {
        self.estimator.estimate(ctx, origin, destination).await
    }

    pub fn estimator_name(&self) -> &'static str {
        self.estimator.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::HeuristicEstimator;
    use ridegrid_state::MemoryKv;

    struct Fixture {
        kv: Arc<MemoryKv>,
        keys: KeySpace,
        svc: GeoQueryService,
    }

    fn fixture() -> Fixture {
        let kv = Arc::new(MemoryKv::new());
        let keys = KeySpace::new("t");
        let svc = GeoQueryService::new(kv.clone(), keys.clone(), Arc::new(HeuristicEstimator::default()));
        Fixture { kv, keys, svc }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("test")
    }

    async fn index(f: &Fixture, d: DriverId, lat: f64, lon: f64) {
        f.kv.geo_add(&ctx(), &f.keys.geo_index(), &d.to_string(), lat, lon)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nearest_is_sorted_and_limited() {
        let f = fixture();
        let near = DriverId::new();
        let mid = DriverId::new();
        let far = DriverId::new();
        index(&f, far, 37.7790, -122.4194).await;
        index(&f, near, 37.7749, -122.4194).await;
        index(&f, mid, 37.7760, -122.4194).await;

        let all = f.svc.nearest_available(&ctx(), 37.7750, -122.4195, 1_000.0, 10).await.unwrap();
        let ids: Vec<_> = all.iter().map(|n| n.driver_id).collect();
        assert_eq!(ids, vec![near, mid, far]);
        assert!((all[0].distance_m - 13.0).abs() < 2.0);

        let two = f.svc.nearest_available(&ctx(), 37.7750, -122.4195, 1_000.0, 2).await.unwrap();
        assert_eq!(two.len(), 2);

        let tight = f.svc.nearest_available(&ctx(), 37.7750, -122.4195, 100.0, 10).await.unwrap();
        assert_eq!(tight.len(), 1);
    }

    #[tokio::test]
    async fn bad_query_parameters_are_rejected() {
        let f = fixture();
        for (lat, radius, limit) in [(91.0, 100.0, 5), (0.0, 0.0, 5), (0.0, 60_000.0, 5), (0.0, 100.0, 0), (0.0, 100.0, 101)] {
            let err = f.svc.nearest_available(&ctx(), lat, 0.0, radius, limit).await.unwrap_err();
            assert!(matches!(err, GeoError::InvalidInput(_)), "{lat} {radius} {limit}");
        }
    }

    #[tokio::test]
    async fn location_follows_presence_record() {
        let f = fixture();
        let d = DriverId::new();
        assert!(matches!(
            f.svc.driver_location(&ctx(), &d).await.unwrap_err(),
            GeoError::NotFound(id) if id == d
        ));

        let point = GeoPoint::now(1.5, 2.5);
        let presence = DriverPresence {
            driver_id: d,
            last_point: point.clone(),
            last_seen: point.recorded_at,
            is_online: true,
            is_available: true,
            ride_id: None,
        };
        f.kv.set_with_ttl(
            &ctx(),
            &f.keys.presence(&d),
            &serde_json::to_vec(&presence).unwrap(),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert_eq!(f.svc.driver_location(&ctx(), &d).await.unwrap(), point);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(f.svc.driver_location(&ctx(), &d).await.is_err());
    }

    #[tokio::test]
    async fn history_reads_newest_first() {
        let f = fixture();
        let d = DriverId::new();
        let points: Vec<GeoPoint> = (0..3).map(|i| GeoPoint::now(1.0, i as f64)).collect();
        let entries: Vec<Vec<u8>> = points.iter().map(|p| serde_json::to_vec(p).unwrap()).collect();
        f.kv.list_push_trim(&ctx(), &f.keys.history(&d), &entries, 50, Duration::from_secs(60))
            .await
            .unwrap();

        let history = f.svc.history(&ctx(), &d, 2).await.unwrap();
        assert_eq!(history, vec![points[2].clone(), points[1].clone()]);
    }

    #[tokio::test]
    async fn kv_outage_surfaces_as_unavailable() {
        let f = fixture();
        f.kv.set_failing(true);
        let err = f.svc.nearest_available(&ctx(), 0.0, 0.0, 100.0, 5).await.unwrap_err();
        assert_eq!(err.kind(), ridegrid_core::ErrorKind::Unavailable);
    }
}
