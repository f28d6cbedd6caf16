//! EtaTracker — one recomputation task per active ride.
//!
//! Each ride gets its own task and cancellation token, in the shape of a
//! per-target monitor slot: starting a ride twice keeps the first task,
//! stopping it cancels the token and aborts the task. Ticks share a worker
//! semaphore so a burst of rides cannot run more than `worker_pool_size`
//! recomputations at once.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::{RwLock, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ridegrid_core::config::EtaConfig;
use ridegrid_core::{
    DriverId, EtaUpdate, GeoPoint, Interrupted, RequestContext, RideId, RideStatus, RideTracking,
};
use ridegrid_geo::{GeoError, GeoQueryService};

use crate::error::EtaError;
use crate::publisher::Publisher;
use crate::stats::{TrackerStats, TrackerStatsSnapshot};

/// Upper bound on how often the reaper looks for expired rides.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

struct RideSlot {
    record: Arc<Mutex<RideTracking>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RideSlot {
    fn shut(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Published,
    Unchanged,
    PublishFailed,
    Missed,
}

pub struct EtaTracker {
    config: EtaConfig,
    geo: GeoQueryService,
    publisher: Arc<dyn Publisher>,
    rides: RwLock<HashMap<RideId, RideSlot>>,
    workers: Arc<Semaphore>,
    stats: TrackerStats,
    /// Parent of every ride token; cancelled only by `stop_all`.
    root: CancellationToken,
    shutdown_tx: watch::Sender<bool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

fn lock(record: &Mutex<RideTracking>) -> MutexGuard<'_, RideTracking> {
    record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Whether a freshly computed ETA should go out: always for the first one,
/// then on a change of at least `eta_change_threshold` or once
/// `force_publish_interval` has passed since the last publish.
pub fn publish_due(record: &RideTracking, eta_secs: f64, now: DateTime<Utc>, config: &EtaConfig) -> bool {
    let (Some(previous), Some(at)) = (record.last_eta_secs, record.last_eta_computed_at) else {
        return true;
    };
    if (eta_secs - previous).abs() >= config.change_threshold().as_secs_f64() {
        return true;
    }
    (now - at).to_std().unwrap_or_default() >= config.force_publish_interval()
}

fn same_place(a: &GeoPoint, b: &GeoPoint) -> bool {
    a.latitude == b.latitude && a.longitude == b.longitude
}

impl EtaTracker {
    pub fn new(config: EtaConfig, geo: GeoQueryService, publisher: Arc<dyn Publisher>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            workers: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            config,
            geo,
            publisher,
            rides: RwLock::new(HashMap::new()),
            stats: TrackerStats::default(),
            root: CancellationToken::new(),
            shutdown_tx,
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EtaConfig {
        &self.config
    }

    pub fn publisher_name(&self) -> &'static str {
        self.publisher.name()
    }

    /// Begin recomputing ETA for a ride. A ride already tracked for the same
    /// driver and destination is left as is and its record returned; a
    /// changed assignment or a stale ride gets a fresh task.
    pub async fn start_tracking(
        self: &Arc<Self>,
        ride_id: RideId,
        driver_id: DriverId,
        destination: GeoPoint,
    ) -> Result<RideTracking, EtaError> {
        if self.root.is_cancelled() {
            return Err(EtaError::ShuttingDown);
        }
        destination
            .validate(None)
            .map_err(|e| EtaError::InvalidInput(format!("destination: {e}")))?;

        let mut rides = self.rides.write().await;
        let mut status = RideStatus::PickingUp;
        if let Some(slot) = rides.get(&ride_id) {
            let current = lock(&slot.record).clone();
            if current.status.is_tracked()
                && current.driver_id == driver_id
                && same_place(&current.destination, &destination)
            {
                debug!(%ride_id, "ride already tracked");
                return Ok(current);
            }
            if current.status.is_tracked() {
                status = current.status;
            }
        }

        let record = RideTracking {
            ride_id,
            driver_id,
            destination,
            started_at: Utc::now(),
            last_eta_secs: None,
            last_eta_computed_at: None,
            status,
            missed_ticks: 0,
        };
        let shared = Arc::new(Mutex::new(record.clone()));
        let cancel = self.root.child_token();
        let handle = tokio::spawn(Arc::clone(self).ride_loop(ride_id, Arc::clone(&shared), cancel.clone()));
        if let Some(old) = rides.insert(
            ride_id,
            RideSlot {
                record: shared,
                cancel,
                handle,
            },
        ) {
            old.shut();
        }
        self.stats.record_started();
        info!(%ride_id, %driver_id, "eta tracking started");
        Ok(record)
    }

    /// Stop tracking and cancel any in-flight tick. Returns whether the ride
    /// was tracked; an absent ride is not an error.
    pub async fn stop_tracking(&self, ride_id: &RideId) -> bool {
        let removed = self.rides.write().await.remove(ride_id);
        match removed {
            Some(slot) => {
                slot.shut();
                self.stats.record_stopped();
                info!(%ride_id, "eta tracking stopped");
                true
            }
            None => {
                debug!(%ride_id, "stop for untracked ride");
                false
            }
        }
    }

    /// Apply a ride status change from the ride service. Terminal statuses
    /// stop tracking and return `None`.
    pub async fn update_status(&self, ride_id: RideId, status: RideStatus) -> Result<Option<RideTracking>, EtaError> {
        if status.is_terminal() {
            self.stop_tracking(&ride_id).await;
            return Ok(None);
        }
        if !status.is_tracked() {
            return Err(EtaError::InvalidInput(format!("status {status:?} cannot be set")));
        }
        let rides = self.rides.read().await;
        let slot = rides.get(&ride_id).ok_or(EtaError::NotTracked(ride_id))?;
        let mut record = lock(&slot.record);
        if record.status.is_tracked() {
            record.status = status;
        }
        Ok(Some(record.clone()))
    }

    pub async fn tracking(&self, ride_id: &RideId) -> Option<RideTracking> {
        let rides = self.rides.read().await;
        rides.get(ride_id).map(|slot| lock(&slot.record).clone())
    }

    pub async fn rides(&self) -> Vec<RideTracking> {
        let rides = self.rides.read().await;
        rides.values().map(|slot| lock(&slot.record).clone()).collect()
    }

    /// Rides still being recomputed (stale records excluded).
    pub async fn active_count(&self) -> usize {
        let rides = self.rides.read().await;
        rides
            .values()
            .filter(|slot| lock(&slot.record).status.is_tracked())
            .count()
    }

    pub async fn stats(&self) -> TrackerStatsSnapshot {
        self.stats.snapshot(self.active_count().await as u64)
    }

    /// Drop rides older than `ride_tracking_max_age`. Protects against a lost
    /// terminal signal from the ride service.
    pub async fn reap_expired(&self) -> usize {
        let max_age = self.config.max_age();
        let now = Utc::now();
        let mut rides = self.rides.write().await;
        let expired: Vec<RideId> = rides
            .iter()
            .filter(|(_, slot)| (now - lock(&slot.record).started_at).to_std().unwrap_or_default() >= max_age)
            .map(|(id, _)| *id)
            .collect();
        for ride_id in &expired {
            if let Some(slot) = rides.remove(ride_id) {
                slot.shut();
                warn!(%ride_id, "ride tracking exceeded max age, dropped");
            }
        }
        self.stats.record_reaped(expired.len() as u64);
        expired.len()
    }

    /// Spawn the reaper. Ride tasks are spawned by `start_tracking`.
    pub fn start(self: &Arc<Self>) {
        let handle = tokio::spawn(Arc::clone(self).reaper_loop(self.shutdown_tx.subscribe()));
        let mut reaper = self.reaper.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = reaper.replace(handle) {
            old.abort();
        }
    }

    /// Stop every ride task and the reaper (for graceful shutdown).
    pub async fn stop_all(&self) {
        let _ = self.shutdown_tx.send(true);
        self.root.cancel();
        if let Some(handle) = self.reaper.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
        let mut rides = self.rides.write().await;
        for (ride_id, slot) in rides.drain() {
            slot.shut();
            debug!(%ride_id, "eta tracking stopped");
        }
        info!("all eta tracking stopped");
    }

    async fn reaper_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let every = self.config.max_age().min(REAP_INTERVAL);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(every) => {
                    let reaped = self.reap_expired().await;
                    if reaped > 0 {
                        info!(reaped, "expired ride tracking removed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn ride_loop(self: Arc<Self>, ride_id: RideId, record: Arc<Mutex<RideTracking>>, cancel: CancellationToken) {
        let budget = self.config.tick_budget();
        let root_ctx = RequestContext::background(&format!("eta-{ride_id}"), cancel.clone());
        let mut ticker = tokio::time::interval(self.config.refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(%ride_id, "eta loop starting");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.stats.record_tick();
            let ctx = root_ctx.child_with_timeout(budget);
            let outcome = match AssertUnwindSafe(ctx.run(budget, self.tick(&ctx, &record))).catch_unwind().await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(Interrupted::Cancelled)) => break,
                Ok(Err(Interrupted::DeadlineExceeded)) => {
                    self.stats.record_timeout();
                    debug!(%ride_id, budget_ms = budget.as_millis() as u64, "eta tick exceeded budget");
                    TickOutcome::Missed
                }
                Err(_) => {
                    self.stats.record_panic();
                    error!(%ride_id, "eta tick panicked");
                    TickOutcome::Missed
                }
            };
            drop(permit);

            if outcome == TickOutcome::Missed {
                if !self.record_miss(&record) {
                    break;
                }
            } else {
                lock(&record).missed_ticks = 0;
            }
        }
        debug!(%ride_id, "eta loop stopped");
    }

    /// Count a missed tick. Returns false once the ride went stale and
    /// should no longer be scheduled.
    fn record_miss(&self, record: &Mutex<RideTracking>) -> bool {
        self.stats.record_missed();
        let mut r = lock(record);
        r.missed_ticks += 1;
        if r.missed_ticks < self.config.missed_ticks_threshold {
            return true;
        }
        r.status = RideStatus::StaleTracking;
        self.stats.record_stale();
        info!(ride_id = %r.ride_id, driver_id = %r.driver_id, missed = r.missed_ticks, "driver location lost, eta tracking stale");
        false
    }

    async fn tick(&self, ctx: &RequestContext, record: &Mutex<RideTracking>) -> TickOutcome {
        let current = lock(record).clone();
        let point = match self.geo.driver_location(ctx, &current.driver_id).await {
            Ok(point) => point,
            Err(GeoError::NotFound(_)) => {
                debug!(ride_id = %current.ride_id, driver_id = %current.driver_id, "driver location unavailable");
                return TickOutcome::Missed;
            }
            Err(e) => {
                warn!(ride_id = %current.ride_id, error = %e, "driver location lookup failed");
                return TickOutcome::Missed;
            }
        };

        let eta_secs = self
            .geo
            .eta(ctx, &point, &current.destination)
            .await
            .as_secs_f64();
        let now = Utc::now();
        if !publish_due(&current, eta_secs, now, &self.config) {
            return TickOutcome::Unchanged;
        }

        let update = EtaUpdate {
            ride_id: current.ride_id,
            driver_point: point,
            destination: current.destination.clone(),
            eta_secs,
            computed_at: now,
        };
        match self.publisher.publish(ctx, &update).await {
            Ok(()) => {
                self.stats.record_publish(true);
                let mut r = lock(record);
                r.last_eta_secs = Some(eta_secs);
                r.last_eta_computed_at = Some(now);
                debug!(ride_id = %update.ride_id, eta_secs, "eta published");
                TickOutcome::Published
            }
            Err(e) => {
                self.stats.record_publish(false);
                warn!(
                    ride_id = %update.ride_id,
                    publisher = self.publisher.name(),
                    error = %e,
                    "eta publish failed"
                );
                TickOutcome::PublishFailed
            }
        }
    }
}
