//! Per-driver sample buffer.
//!
//! Each driver owns a slot behind its own mutex; the map of slots is only
//! write-locked when a driver is seen for the first time or evicted, so
//! submissions for different drivers do not contend. Nothing here does I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use ridegrid_core::config::IngestConfig;
use ridegrid_core::{DriverId, GeoPoint, RideId};

use crate::error::{QuotaReason, SubmitError};

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Outcome of an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Samples now pending for this driver.
    pub pending: usize,
    /// The driver's buffer reached its cap; an early flush is worthwhile.
    pub flush_hint: bool,
}

/// Everything one flush needs to know about one driver.
#[derive(Debug, Clone)]
pub struct DriverBatch {
    pub driver_id: DriverId,
    /// Samples drained from the buffer, oldest first.
    pub points: Vec<GeoPoint>,
    /// Newest accepted point ever seen, even if already flushed.
    pub latest: Option<GeoPoint>,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_online: bool,
    pub is_available: bool,
    pub ride_id: Option<RideId>,
}

struct DriverSlot {
    pending: VecDeque<GeoPoint>,
    latest: Option<GeoPoint>,
    last_seen: Option<DateTime<Utc>>,
    window_start: Instant,
    window_count: u32,
    is_online: bool,
    is_available: bool,
    ride_id: Option<RideId>,
    status_dirty: bool,
    touched: Instant,
}

impl DriverSlot {
    fn new(now: Instant) -> Self {
        Self {
            pending: VecDeque::new(),
            latest: None,
            last_seen: None,
            window_start: now,
            window_count: 0,
            is_online: true,
            is_available: true,
            ride_id: None,
            status_dirty: false,
            touched: now,
        }
    }

    fn take_batch(&mut self, driver_id: DriverId) -> Option<DriverBatch> {
        if self.pending.is_empty() && !self.status_dirty {
            return None;
        }
        self.status_dirty = false;
        Some(DriverBatch {
            driver_id,
            points: self.pending.drain(..).collect(),
            latest: self.latest.clone(),
            last_seen: self.last_seen,
            is_online: self.is_online,
            is_available: self.is_available,
            ride_id: self.ride_id,
        })
    }
}

pub struct LocationBuffer {
    slots: RwLock<HashMap<DriverId, Arc<Mutex<DriverSlot>>>>,
    total: AtomicUsize,
    max_per_driver: usize,
    max_per_second: u32,
    max_accuracy: Option<f64>,
    global_cap: usize,
}

fn lock_slot(slot: &Mutex<DriverSlot>) -> MutexGuard<'_, DriverSlot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LocationBuffer {
    pub fn new(cfg: &IngestConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            total: AtomicUsize::new(0),
            max_per_driver: cfg.max_samples_per_driver.max(1),
            max_per_second: cfg.max_samples_per_driver_per_second.max(1),
            max_accuracy: cfg.max_accuracy_meters,
            global_cap: cfg.global_buffer_cap.max(1),
        }
    }

    fn slot(&self, driver_id: DriverId, now: Instant) -> Arc<Mutex<DriverSlot>> {
        {
            let slots = self.slots.read().unwrap_or_else(|p| p.into_inner());
            if let Some(slot) = slots.get(&driver_id) {
                return Arc::clone(slot);
            }
        }
        let mut slots = self.slots.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            slots
                .entry(driver_id)
                .or_insert_with(|| Arc::new(Mutex::new(DriverSlot::new(now)))),
        )
    }

    /// Validate and buffer one sample. Checks run in order: point bounds,
    /// staleness against the newest accepted sample, the per-driver rate
    /// window, then the global cap. A rejected sample never evicts
    /// buffered ones.
    pub fn submit(&self, driver_id: DriverId, point: GeoPoint, now: Instant) -> Result<Accepted, SubmitError> {
        point.validate(self.max_accuracy)?;

        let slot = self.slot(driver_id, now);
        let mut slot = lock_slot(&slot);

        if let Some(latest) = &slot.latest {
            if point.recorded_at < latest.recorded_at {
                return Err(SubmitError::Stale {
                    last: latest.recorded_at,
                    got: point.recorded_at,
                });
            }
        }

        if now.duration_since(slot.window_start) >= RATE_WINDOW {
            slot.window_start = now;
            slot.window_count = 0;
        }
        if slot.window_count >= self.max_per_second {
            return Err(SubmitError::QuotaExceeded(QuotaReason::DriverRate));
        }

        let at_cap = slot.pending.len() >= self.max_per_driver;
        if !at_cap && self.total.load(Ordering::Acquire) >= self.global_cap {
            return Err(SubmitError::QuotaExceeded(QuotaReason::GlobalBuffer));
        }

        slot.window_count += 1;
        if at_cap {
            // Oldest sample goes; the buffered total is unchanged.
            slot.pending.pop_front();
        } else {
            self.total.fetch_add(1, Ordering::AcqRel);
        }
        slot.latest = Some(point.clone());
        slot.last_seen = Some(Utc::now());
        slot.touched = now;
        slot.pending.push_back(point);

        Ok(Accepted {
            pending: slot.pending.len(),
            flush_hint: slot.pending.len() >= self.max_per_driver,
        })
    }

    /// Record an explicit status change; picked up by the next drain even
    /// when no samples are pending.
    pub fn set_status(
        &self,
        driver_id: DriverId,
        is_online: bool,
        is_available: bool,
        ride_id: Option<RideId>,
        now: Instant,
    ) {
        let slot = self.slot(driver_id, now);
        let mut slot = lock_slot(&slot);
        slot.is_online = is_online;
        slot.is_available = is_available;
        slot.ride_id = ride_id;
        slot.status_dirty = true;
        slot.touched = now;
    }

    /// Snapshot and clear every driver with pending work.
    pub fn drain(&self) -> Vec<DriverBatch> {
        let slots: Vec<(DriverId, Arc<Mutex<DriverSlot>>)> = {
            let slots = self.slots.read().unwrap_or_else(|p| p.into_inner());
            slots.iter().map(|(id, slot)| (*id, Arc::clone(slot))).collect()
        };
        let mut batches = Vec::new();
        for (driver_id, slot) in slots {
            let mut slot = lock_slot(&slot);
            if let Some(batch) = slot.take_batch(driver_id) {
                self.total.fetch_sub(batch.points.len(), Ordering::AcqRel);
                batches.push(batch);
            }
        }
        batches
    }

    /// Put a failed batch back in front of anything submitted since the
    /// drain, dropping the oldest samples past the per-driver cap.
    /// Returns how many samples were dropped.
    pub fn requeue(&self, batch: DriverBatch, now: Instant) -> usize {
        let slot = self.slot(batch.driver_id, now);
        let mut slot = lock_slot(&slot);
        let restored = batch.points.len();
        for point in batch.points.into_iter().rev() {
            slot.pending.push_front(point);
        }
        let mut dropped = 0;
        while slot.pending.len() > self.max_per_driver {
            slot.pending.pop_front();
            dropped += 1;
        }
        slot.status_dirty = true;
        self.total.fetch_add(restored - dropped, Ordering::AcqRel);
        dropped
    }

    /// Forget drivers with nothing pending that have been quiet for `idle`.
    pub fn evict_idle(&self, idle: Duration, now: Instant) -> usize {
        let mut slots = self.slots.write().unwrap_or_else(|p| p.into_inner());
        let before = slots.len();
        slots.retain(|_, slot| {
            let slot = lock_slot(slot);
            !slot.pending.is_empty() || slot.status_dirty || now.duration_since(slot.touched) < idle
        });
        before - slots.len()
    }

    /// Samples currently buffered across all drivers.
    pub fn buffered(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn driver_count(&self) -> usize {
        self.slots.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ridegrid_core::types::PointError;

    fn config() -> IngestConfig {
        IngestConfig {
            max_samples_per_driver: 3,
            max_samples_per_driver_per_second: 5,
            global_buffer_cap: 100,
            ..IngestConfig::default()
        }
    }

    fn at(secs: i64) -> GeoPoint {
        GeoPoint::new(
            37.7749,
            -122.4194,
            Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        )
    }

    #[test]
    fn accepts_and_drains_in_order() {
        let buf = LocationBuffer::new(&config());
        let d = DriverId::new();
        let t0 = Instant::now();
        buf.submit(d, at(1), t0).unwrap();
        buf.submit(d, at(2), t0).unwrap();
        assert_eq!(buf.buffered(), 2);

        let batches = buf.drain();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.points, vec![at(1), at(2)]);
        assert_eq!(batch.latest, Some(at(2)));
        assert!(batch.is_online && batch.is_available);
        assert_eq!(buf.buffered(), 0);
        assert!(buf.drain().is_empty());
    }

    #[test]
    fn older_sample_is_stale() {
        let buf = LocationBuffer::new(&config());
        let d = DriverId::new();
        let t0 = Instant::now();
        buf.submit(d, at(10), t0).unwrap();
        let err = buf.submit(d, at(9), t0).unwrap_err();
        assert!(matches!(err, SubmitError::Stale { .. }));
        // Equal timestamps are a retry, not a regression.
        buf.submit(d, at(10), t0).unwrap();

        // Staleness survives a drain.
        buf.drain();
        assert!(buf.submit(d, at(5), t0).is_err());
    }

    #[test]
    fn invalid_points_are_rejected() {
        let buf = LocationBuffer::new(&config());
        let d = DriverId::new();
        let mut bad = at(1);
        bad.latitude = f64::NAN;
        assert_eq!(
            buf.submit(d, bad, Instant::now()).unwrap_err(),
            SubmitError::InvalidPoint(PointError::NotFinite("latitude"))
        );
        let sloppy = at(1).with_accuracy(500.0);
        assert!(matches!(
            buf.submit(d, sloppy, Instant::now()).unwrap_err(),
            SubmitError::InvalidPoint(PointError::Accuracy { .. })
        ));
        assert_eq!(buf.buffered(), 0);
    }

    #[test]
    fn rate_limit_within_one_second_window() {
        let cfg = IngestConfig {
            max_samples_per_driver: 50,
            ..config()
        };
        let buf = LocationBuffer::new(&cfg);
        let d = DriverId::new();
        let t0 = Instant::now();
        for i in 0..5 {
            buf.submit(d, at(i), t0).unwrap();
        }
        assert_eq!(
            buf.submit(d, at(6), t0).unwrap_err(),
            SubmitError::QuotaExceeded(QuotaReason::DriverRate)
        );
        // Rejection keeps what was already buffered.
        assert_eq!(buf.buffered(), 5);

        buf.submit(d, at(7), t0 + Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn steady_rate_at_limit_is_never_rejected() {
        let cfg = IngestConfig {
            max_samples_per_driver: 1_000,
            ..config()
        };
        let buf = LocationBuffer::new(&cfg);
        let d = DriverId::new();
        let t0 = Instant::now();
        // Five per second, evenly spaced, for ten seconds.
        for i in 0..50u64 {
            let now = t0 + Duration::from_millis(i * 200);
            buf.submit(d, at(i as i64), now).unwrap();
        }
    }

    #[test]
    fn driver_cap_drops_oldest_and_hints_flush() {
        let buf = LocationBuffer::new(&config());
        let d = DriverId::new();
        let t0 = Instant::now();
        assert!(!buf.submit(d, at(1), t0).unwrap().flush_hint);
        buf.submit(d, at(2), t0).unwrap();
        assert!(buf.submit(d, at(3), t0).unwrap().flush_hint);
        let accepted = buf.submit(d, at(4), t0).unwrap();
        assert_eq!(accepted.pending, 3);
        assert_eq!(buf.buffered(), 3);
        assert_eq!(buf.drain()[0].points, vec![at(2), at(3), at(4)]);
    }

    #[test]
    fn global_cap_rejects_new_samples() {
        let cfg = IngestConfig {
            global_buffer_cap: 2,
            ..config()
        };
        let buf = LocationBuffer::new(&cfg);
        let t0 = Instant::now();
        buf.submit(DriverId::new(), at(1), t0).unwrap();
        buf.submit(DriverId::new(), at(1), t0).unwrap();
        assert_eq!(
            buf.submit(DriverId::new(), at(1), t0).unwrap_err(),
            SubmitError::QuotaExceeded(QuotaReason::GlobalBuffer)
        );
        buf.drain();
        buf.submit(DriverId::new(), at(1), t0).unwrap();
    }

    #[test]
    fn requeue_restores_order_and_respects_cap() {
        let buf = LocationBuffer::new(&config());
        let d = DriverId::new();
        let t0 = Instant::now();
        buf.submit(d, at(1), t0).unwrap();
        buf.submit(d, at(2), t0).unwrap();
        let batch = buf.drain().remove(0);

        buf.submit(d, at(3), t0).unwrap();
        buf.submit(d, at(4), t0).unwrap();
        assert_eq!(buf.requeue(batch, t0), 1);
        assert_eq!(buf.buffered(), 3);
        assert_eq!(buf.drain()[0].points, vec![at(2), at(3), at(4)]);
    }

    #[test]
    fn status_change_produces_batch_without_samples() {
        let buf = LocationBuffer::new(&config());
        let d = DriverId::new();
        let t0 = Instant::now();
        buf.submit(d, at(1), t0).unwrap();
        buf.drain();

        let ride = RideId::new();
        buf.set_status(d, true, false, Some(ride), t0);
        let batch = buf.drain().remove(0);
        assert!(batch.points.is_empty());
        assert!(!batch.is_available);
        assert_eq!(batch.ride_id, Some(ride));
        assert_eq!(batch.latest, Some(at(1)));
    }

    #[test]
    fn idle_drivers_are_evicted() {
        let buf = LocationBuffer::new(&config());
        let t0 = Instant::now();
        let quiet = DriverId::new();
        let busy = DriverId::new();
        buf.submit(quiet, at(1), t0).unwrap();
        buf.submit(busy, at(1), t0).unwrap();
        buf.drain();
        buf.submit(busy, at(2), t0 + Duration::from_secs(30)).unwrap();

        let evicted = buf.evict_idle(Duration::from_secs(10), t0 + Duration::from_secs(31));
        assert_eq!(evicted, 1);
        assert_eq!(buf.driver_count(), 1);
    }
}
