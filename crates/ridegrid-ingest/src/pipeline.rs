//! LocationPipeline — buffer front end plus the flush and persistence loops.
//!
//! `submit` only touches the in-memory buffer. The flush loop drains it every
//! `flush_interval` and writes, per driver, presence (with TTL), geo index
//! membership, and the capped recent-history list. Drivers are flushed
//! concurrently and independently; a failed driver is requeued without
//! affecting the others. Flushed samples queue for the durable sink, which
//! the persistence loop drains every `persist_interval`.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::{FutureExt, StreamExt, stream};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ridegrid_core::config::IngestConfig;
use ridegrid_core::{DriverId, DriverPresence, GeoPoint, LocationSample, RequestContext, RideId};
use ridegrid_state::{KeySpace, KvError, KvResult, KvStore, SampleSink};

use crate::backoff::FlushTracker;
use crate::buffer::{Accepted, DriverBatch, LocationBuffer};
use crate::error::SubmitError;
use crate::stats::{IngestStats, IngestStatsSnapshot};

/// Deadline for one whole flush tick.
const FLUSH_BUDGET: Duration = Duration::from_secs(5);
/// Drivers written concurrently within one tick.
const FLUSH_CONCURRENCY: usize = 32;
/// Lifetime of the recent-history list after its last append.
const HISTORY_TTL: Duration = Duration::from_secs(6 * 3600);
/// Expired index members removed per tick.
const PRUNE_BATCH: usize = 500;
/// Quiet drivers are forgotten after this many presence TTLs.
const IDLE_EVICT_TTLS: u32 = 10;

/// What one flush tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Drivers whose writes all succeeded.
    pub drivers: u64,
    /// Drivers whose writes failed and were requeued.
    pub failed: u64,
    /// Samples moved out of the buffer.
    pub samples: u64,
    pub requeue_dropped: u64,
    /// Expired drivers removed from the geo index.
    pub pruned: u64,
}

pub struct LocationPipeline {
    config: IngestConfig,
    buffer: LocationBuffer,
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    sink: Arc<dyn SampleSink>,
    stats: IngestStats,
    tracker: Mutex<FlushTracker>,
    persist_queue: Mutex<VecDeque<LocationSample>>,
    /// Serializes flushes so an older batch never lands after a newer one.
    flush_gate: tokio::sync::Mutex<()>,
    flush_now: Notify,
    shutdown_tx: watch::Sender<bool>,
    root: CancellationToken,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn encode_err(e: serde_json::Error) -> KvError {
    KvError::Decode(format!("encode: {e}"))
}

impl LocationPipeline {
    pub fn new(
        config: IngestConfig,
        kv: Arc<dyn KvStore>,
        keys: KeySpace,
        sink: Arc<dyn SampleSink>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            buffer: LocationBuffer::new(&config),
            tracker: Mutex::new(FlushTracker::new(&config)),
            config,
            kv,
            keys,
            sink,
            stats: IngestStats::default(),
            persist_queue: Mutex::new(VecDeque::new()),
            flush_gate: tokio::sync::Mutex::new(()),
            flush_now: Notify::new(),
            shutdown_tx,
            root: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Buffer one sample. Never waits on I/O.
    pub fn submit(&self, driver_id: DriverId, point: GeoPoint) -> Result<Accepted, SubmitError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown);
        }
        match self.buffer.submit(driver_id, point, Instant::now()) {
            Ok(accepted) => {
                self.stats.record_accepted();
                if accepted.flush_hint {
                    self.flush_now.notify_one();
                }
                Ok(accepted)
            }
            Err(e) => {
                self.stats.record_rejected(&e);
                if !matches!(e, SubmitError::InvalidPoint(_)) {
                    info!(%driver_id, error = %e, "location rejected");
                }
                Err(e)
            }
        }
    }

    /// Update a driver's dispatch status. Going offline also removes the
    /// driver from the index and drops its presence right away; other
    /// changes take effect on the next flush.
    pub async fn set_status(
        &self,
        ctx: &RequestContext,
        driver_id: DriverId,
        is_online: bool,
        is_available: bool,
        ride_id: Option<RideId>,
    ) -> KvResult<()> {
        self.buffer
            .set_status(driver_id, is_online, is_available, ride_id, Instant::now());
        if !is_online {
            self.remove_from_index(ctx, &driver_id).await?;
            self.kv.delete(ctx, &[self.keys.presence(&driver_id)]).await?;
            info!(%driver_id, "driver went offline");
        }
        Ok(())
    }

    pub fn stats(&self) -> IngestStatsSnapshot {
        self.stats
            .snapshot(self.buffer.buffered(), lock(&self.persist_queue).len())
    }

    pub fn is_degraded(&self) -> bool {
        self.stats.is_degraded()
    }

    pub fn buffer(&self) -> &LocationBuffer {
        &self.buffer
    }

    /// Run one flush tick now.
    pub async fn flush_once(&self) -> FlushReport {
        self.flush(false).await
    }

    async fn flush(&self, early: bool) -> FlushReport {
        let _serial = self.flush_gate.lock().await;
        let ctx = RequestContext::background("ingest-flush", self.root.child_token())
            .child_with_timeout(FLUSH_BUDGET);
        let now = Utc::now();
        let mut report = FlushReport::default();

        let batches = self.buffer.drain();
        if !batches.is_empty() {
            let outcomes: Vec<(DriverBatch, KvResult<()>)> = stream::iter(batches)
                .map(|batch| {
                    let ctx = &ctx;
                    async move {
                        let result = self.flush_driver(ctx, &batch, now).await;
                        (batch, result)
                    }
                })
                .buffer_unordered(FLUSH_CONCURRENCY)
                .collect()
                .await;

            for (batch, result) in outcomes {
                match result {
                    Ok(()) => {
                        report.drivers += 1;
                        report.samples += batch.points.len() as u64;
                        self.enqueue_persist(&batch);
                    }
                    Err(e) => {
                        report.failed += 1;
                        if !matches!(e, KvError::Cancelled) {
                            warn!(driver_id = %batch.driver_id, error = %e, "driver flush failed, requeued");
                        }
                        report.requeue_dropped += self.buffer.requeue(batch, Instant::now()) as u64;
                    }
                }
            }
        }

        match self.prune_expired(&ctx).await {
            Ok(pruned) => report.pruned = pruned,
            Err(e) => debug!(error = %e, "geo index prune skipped"),
        }
        self.stats.record_pruned(report.pruned);
        self.buffer
            .evict_idle(self.config.presence_ttl() * IDLE_EVICT_TTLS, Instant::now());

        {
            let mut tracker = lock(&self.tracker);
            if report.drivers > 0 {
                tracker.record_success();
            } else if report.failed > 0 {
                tracker.record_failure();
            }
            self.stats.set_degraded(tracker.is_degraded());
        }
        self.stats
            .record_flush(early, report.failed, report.requeue_dropped);
        if report.drivers > 0 || report.failed > 0 {
            debug!(
                drivers = report.drivers,
                failed = report.failed,
                samples = report.samples,
                early,
                "ingest flush complete"
            );
        }
        report
    }

    async fn flush_driver(
        &self,
        ctx: &RequestContext,
        batch: &DriverBatch,
        now: DateTime<Utc>,
    ) -> KvResult<()> {
        let driver_id = batch.driver_id;
        let presence_key = self.keys.presence(&driver_id);

        match self.presence_for(batch, now) {
            Some((presence, ttl)) => {
                let raw = serde_json::to_vec(&presence).map_err(encode_err)?;
                self.kv.set_with_ttl(ctx, &presence_key, &raw, ttl).await?;
                if presence.dispatchable() {
                    let member = driver_id.to_string();
                    self.kv
                        .geo_add(
                            ctx,
                            &self.keys.geo_index(),
                            &member,
                            presence.last_point.latitude,
                            presence.last_point.longitude,
                        )
                        .await?;
                    self.kv
                        .zadd(
                            ctx,
                            &self.keys.geo_seen(),
                            &member,
                            presence.last_seen.timestamp_millis() as f64,
                        )
                        .await?;
                } else {
                    self.remove_from_index(ctx, &driver_id).await?;
                }
            }
            None => {
                if !batch.is_online {
                    self.kv.delete(ctx, &[presence_key]).await?;
                }
                self.remove_from_index(ctx, &driver_id).await?;
            }
        }

        if !batch.points.is_empty() {
            let entries = batch
                .points
                .iter()
                .map(serde_json::to_vec)
                .collect::<Result<Vec<_>, _>>()
                .map_err(encode_err)?;
            self.kv
                .list_push_trim(
                    ctx,
                    &self.keys.history(&driver_id),
                    &entries,
                    self.config.history_size,
                    HISTORY_TTL,
                )
                .await?;
        }
        Ok(())
    }

    /// Presence to write and its remaining TTL, or `None` when the driver is
    /// offline, has never reported, or its last report already expired.
    fn presence_for(&self, batch: &DriverBatch, now: DateTime<Utc>) -> Option<(DriverPresence, Duration)> {
        if !batch.is_online {
            return None;
        }
        let last_point = batch.latest.clone()?;
        let last_seen = batch.last_seen?;
        let age = (now - last_seen).to_std().unwrap_or_default();
        let ttl = self.config.presence_ttl().saturating_sub(age);
        if ttl < Duration::from_millis(1) {
            return None;
        }
        Some((
            DriverPresence {
                driver_id: batch.driver_id,
                last_point,
                last_seen,
                is_online: batch.is_online,
                is_available: batch.is_available,
                ride_id: batch.ride_id,
            },
            ttl,
        ))
    }

    async fn remove_from_index(&self, ctx: &RequestContext, driver_id: &DriverId) -> KvResult<()> {
        let member = driver_id.to_string();
        self.kv.geo_remove(ctx, &self.keys.geo_index(), &member).await?;
        self.kv.zrem(ctx, &self.keys.geo_seen(), &[member]).await?;
        Ok(())
    }

    /// Drop index members whose last report is older than the presence
    /// TTL; their presence key has expired by now.
    async fn prune_expired(&self, ctx: &RequestContext) -> KvResult<u64> {
        let cutoff =
            Utc::now().timestamp_millis() - self.config.presence_ttl().as_millis() as i64;
        let seen = self.keys.geo_seen();
        let stale = self
            .kv
            .zrange_below(ctx, &seen, cutoff as f64, PRUNE_BATCH)
            .await?;
        if stale.is_empty() {
            return Ok(0);
        }
        let index = self.keys.geo_index();
        for member in &stale {
            self.kv.geo_remove(ctx, &index, member).await?;
        }
        self.kv.zrem(ctx, &seen, &stale).await?;
        debug!(count = stale.len(), "pruned expired drivers from geo index");
        Ok(stale.len() as u64)
    }

    fn enqueue_persist(&self, batch: &DriverBatch) {
        if batch.points.is_empty() {
            return;
        }
        let mut queue = lock(&self.persist_queue);
        queue.extend(batch.points.iter().map(|point| LocationSample {
            driver_id: batch.driver_id,
            point: point.clone(),
        }));
        let overflow = queue.len().saturating_sub(self.config.persist_queue_cap);
        if overflow > 0 {
            queue.drain(..overflow);
            drop(queue);
            self.stats.record_persist_dropped(overflow as u64);
            warn!(dropped = overflow, "persist queue full, dropping oldest samples");
        }
    }

    /// Write everything queued for the durable sink in bounded batches.
    /// Failed batches are logged and dropped. Returns samples written.
    pub async fn persist_once(&self) -> usize {
        let pending: Vec<LocationSample> = lock(&self.persist_queue).drain(..).collect();
        if pending.is_empty() {
            return 0;
        }
        let ctx = RequestContext::background("ingest-persist", self.root.child_token());
        let mut written = 0;
        for chunk in pending.chunks(self.config.persist_batch_max.max(1)) {
            match self.sink.insert_location_batch(&ctx, chunk).await {
                Ok(n) => {
                    written += n;
                    self.stats.record_persisted(n as u64);
                }
                Err(e) => {
                    self.stats.record_persist_dropped(chunk.len() as u64);
                    warn!(error = %e, dropped = chunk.len(), "durable sample write failed");
                }
            }
        }
        debug!(written, "location samples persisted");
        written
    }

    /// Spawn the flush and persistence loops.
    pub fn start(self: &Arc<Self>) {
        let flush = tokio::spawn(Arc::clone(self).flush_loop(self.shutdown_tx.subscribe()));
        let persist = tokio::spawn(Arc::clone(self).persist_loop(self.shutdown_tx.subscribe()));
        lock(&self.tasks).extend([flush, persist]);
        info!(
            flush_interval_ms = self.config.flush_interval_ms,
            persist_interval_ms = self.config.persist_interval_ms,
            "ingest pipeline started"
        );
    }

    async fn flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let (interval, degraded) = {
                let tracker = lock(&self.tracker);
                (tracker.next_interval(), tracker.is_degraded())
            };
            let early = tokio::select! {
                _ = tokio::time::sleep(interval) => false,
                _ = self.flush_now.notified(), if !degraded => true,
                _ = shutdown.changed() => {
                    debug!("flush loop shutting down");
                    break;
                }
            };
            if AssertUnwindSafe(self.flush(early)).catch_unwind().await.is_err() {
                error!("ingest flush tick panicked");
            }
        }
    }

    async fn persist_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.persist_interval()) => {
                    if AssertUnwindSafe(self.persist_once()).catch_unwind().await.is_err() {
                        error!("ingest persist tick panicked");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("persist loop shutting down");
                    break;
                }
            }
        }
    }

    /// Stop accepting samples, halt the loops, and drain the buffer to KV
    /// and the persist queue to the sink within `stop_deadline`.
    pub async fn stop(&self) -> FlushReport {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return FlushReport::default();
        }
        let _ = self.shutdown_tx.send(true);
        let handles = std::mem::take(&mut *lock(&self.tasks));

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
            let report = self.flush(false).await;
            let persisted = self.persist_once().await;
            (report, persisted)
        };
        let report = match tokio::time::timeout(self.config.stop_deadline(), drain).await {
            Ok((report, persisted)) => {
                info!(
                    drivers = report.drivers,
                    samples = report.samples,
                    persisted,
                    "ingest pipeline drained"
                );
                report
            }
            Err(_) => {
                warn!(
                    deadline_ms = self.config.stop_deadline_ms,
                    buffered = self.buffer.buffered(),
                    "ingest drain exceeded deadline"
                );
                FlushReport::default()
            }
        };
        self.root.cancel();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use ridegrid_state::{MemoryKv, SampleStore, StateError, StateResult};

    fn config() -> IngestConfig {
        IngestConfig {
            flush_interval_ms: 50,
            persist_interval_ms: 60_000,
            degraded_after_failures: 2,
            ..IngestConfig::default()
        }
    }

    struct Harness {
        kv: Arc<MemoryKv>,
        store: SampleStore,
        keys: KeySpace,
        pipeline: Arc<LocationPipeline>,
    }

    fn harness(config: IngestConfig) -> Harness {
        let kv = Arc::new(MemoryKv::new());
        let store = SampleStore::open_in_memory().unwrap();
        let keys = KeySpace::new("t");
        let pipeline = Arc::new(LocationPipeline::new(
            config,
            kv.clone(),
            keys.clone(),
            Arc::new(store.clone()),
        ));
        Harness {
            kv,
            store,
            keys,
            pipeline,
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("test")
    }

    fn at(lat: f64, lon: f64, secs: i64) -> GeoPoint {
        GeoPoint::new(lat, lon, Utc::now() + chrono::Duration::seconds(secs))
    }

    async fn presence(h: &Harness, d: &DriverId) -> Option<DriverPresence> {
        h.kv.get_bytes(&ctx(), &h.keys.presence(d))
            .await
            .unwrap()
            .map(|raw| serde_json::from_slice(&raw).unwrap())
    }

    async fn nearby(h: &Harness, lat: f64, lon: f64) -> Vec<String> {
        h.kv.geo_radius(&ctx(), &h.keys.geo_index(), lat, lon, 500.0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|hit| hit.member)
            .collect()
    }

    #[tokio::test]
    async fn flush_writes_presence_index_and_history() {
        let h = harness(config());
        let d = DriverId::new();
        h.pipeline.submit(d, at(37.7740, -122.4190, -2)).unwrap();
        h.pipeline.submit(d, at(37.7749, -122.4194, -1)).unwrap();

        let report = h.pipeline.flush_once().await;
        assert_eq!(report.drivers, 1);
        assert_eq!(report.samples, 2);

        let p = presence(&h, &d).await.unwrap();
        assert_eq!(p.last_point.latitude, 37.7749);
        assert!(p.dispatchable());

        let hits = h
            .kv
            .geo_radius(&ctx(), &h.keys.geo_index(), 37.7750, -122.4195, 500.0, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].member, d.to_string());
        assert!((hits[0].distance_m - 13.0).abs() < 2.0);

        let history = h.kv.list_range(&ctx(), &h.keys.history(&d), 10).await.unwrap();
        assert_eq!(history.len(), 2);
        let newest: GeoPoint = serde_json::from_slice(&history[0]).unwrap();
        assert_eq!(newest.latitude, 37.7749);
    }

    #[tokio::test]
    async fn index_liveness_tracks_report_time_not_flush_time() {
        let h = harness(config());
        let d = DriverId::new();
        h.pipeline.submit(d, at(5.0, 5.0, 0)).unwrap();
        let reported_by = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        h.pipeline.flush_once().await;

        let seen = h
            .kv
            .zrange_below(&ctx(), &h.keys.geo_seen(), reported_by.timestamp_millis() as f64, 10)
            .await
            .unwrap();
        assert_eq!(seen, vec![d.to_string()]);
    }

    #[tokio::test]
    async fn stale_submission_keeps_newer_presence() {
        let h = harness(config());
        let d = DriverId::new();
        let t10 = Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap();
        h.pipeline
            .submit(d, GeoPoint::new(10.0, 10.0, t10))
            .unwrap();
        let err = h
            .pipeline
            .submit(d, GeoPoint::new(11.0, 11.0, t10 - chrono::Duration::seconds(1)))
            .unwrap_err();
        assert!(matches!(err, SubmitError::Stale { .. }));

        h.pipeline.flush_once().await;
        assert_eq!(presence(&h, &d).await.unwrap().last_point.recorded_at, t10);
        assert_eq!(h.pipeline.stats().rejected_stale, 1);
    }

    #[tokio::test]
    async fn unavailable_driver_leaves_index() {
        let h = harness(config());
        let d = DriverId::new();
        h.pipeline.submit(d, at(1.0, 1.0, 0)).unwrap();
        h.pipeline.flush_once().await;
        assert_eq!(nearby(&h, 1.0, 1.0).await.len(), 1);

        h.pipeline
            .set_status(&ctx(), d, true, false, Some(RideId::new()))
            .await
            .unwrap();
        h.pipeline.flush_once().await;
        assert!(nearby(&h, 1.0, 1.0).await.is_empty());
        // Still locatable while on a ride.
        let p = presence(&h, &d).await.unwrap();
        assert!(!p.is_available);
        assert!(p.ride_id.is_some());
    }

    #[tokio::test]
    async fn going_offline_removes_immediately() {
        let h = harness(config());
        let d = DriverId::new();
        h.pipeline.submit(d, at(1.0, 1.0, 0)).unwrap();
        h.pipeline.flush_once().await;

        h.pipeline.set_status(&ctx(), d, false, false, None).await.unwrap();
        assert!(nearby(&h, 1.0, 1.0).await.is_empty());
        assert!(presence(&h, &d).await.is_none());

        // A later flush does not resurrect it.
        h.pipeline.flush_once().await;
        assert!(presence(&h, &d).await.is_none());
    }

    #[tokio::test]
    async fn failing_driver_does_not_block_others() {
        let h = harness(config());
        let good = DriverId::new();
        let bad = DriverId::new();
        h.kv.poison(bad.to_string());
        h.pipeline.submit(good, at(1.0, 1.0, 0)).unwrap();
        h.pipeline.submit(bad, at(1.0, 1.0, 0)).unwrap();

        let report = h.pipeline.flush_once().await;
        assert_eq!(report.drivers, 1);
        assert_eq!(report.failed, 1);
        assert!(presence(&h, &good).await.is_some());
        assert!(!h.pipeline.is_degraded());
        // The failed driver's sample waits for the next flush.
        assert_eq!(h.pipeline.buffer().buffered(), 1);

        h.kv.clear_poison();
        let report = h.pipeline.flush_once().await;
        assert_eq!(report.drivers, 1);
        assert!(presence(&h, &bad).await.is_some());
    }

    #[tokio::test]
    async fn degraded_mode_enters_and_recovers() {
        let h = harness(config());
        let d = DriverId::new();
        h.kv.set_failing(true);

        h.pipeline.submit(d, at(1.0, 1.0, 0)).unwrap();
        h.pipeline.flush_once().await;
        assert!(!h.pipeline.is_degraded());
        h.pipeline.flush_once().await;
        assert!(h.pipeline.is_degraded());

        // Submissions keep landing in the buffer.
        h.pipeline.submit(d, at(1.0, 1.0, 1)).unwrap();
        assert_eq!(h.pipeline.buffer().buffered(), 2);

        h.kv.set_failing(false);
        let report = h.pipeline.flush_once().await;
        assert_eq!(report.samples, 2);
        assert!(!h.pipeline.is_degraded());
        let stats = h.pipeline.stats();
        assert_eq!(stats.flush_failures, 2);
        assert!(!stats.degraded);
    }

    #[tokio::test]
    async fn persist_writes_flushed_samples() {
        let h = harness(IngestConfig {
            persist_batch_max: 2,
            ..config()
        });
        let d = DriverId::new();
        for i in 0..3 {
            h.pipeline.submit(d, at(1.0, 1.0, i)).unwrap();
        }
        // Nothing reaches the sink before the KV flush.
        assert_eq!(h.pipeline.persist_once().await, 0);

        h.pipeline.flush_once().await;
        assert_eq!(h.pipeline.stats().persist_queue, 3);
        assert_eq!(h.pipeline.persist_once().await, 3);
        assert_eq!(h.store.count().unwrap(), 3);
        assert_eq!(h.pipeline.stats().persisted, 3);
    }

    struct BrokenSink;

    #[async_trait]
    impl SampleSink for BrokenSink {
        async fn insert_location_batch(
            &self,
            _ctx: &RequestContext,
            _batch: &[LocationSample],
        ) -> StateResult<usize> {
            Err(StateError::Write("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn sink_failure_drops_and_counts() {
        let kv = Arc::new(MemoryKv::new());
        let pipeline = LocationPipeline::new(config(), kv, KeySpace::new("t"), Arc::new(BrokenSink));
        let d = DriverId::new();
        pipeline.submit(d, at(1.0, 1.0, 0)).unwrap();
        pipeline.flush_once().await;

        assert_eq!(pipeline.persist_once().await, 0);
        let stats = pipeline.stats();
        assert_eq!(stats.persist_dropped, 1);
        assert_eq!(stats.persist_queue, 0);
        // The KV side is unaffected.
        assert_eq!(stats.flush_failures, 0);
    }

    #[tokio::test]
    async fn expired_drivers_are_pruned_from_index() {
        let h = harness(IngestConfig {
            presence_ttl_sec: 1,
            ..config()
        });
        let d = DriverId::new();
        h.pipeline.submit(d, at(1.0, 1.0, 0)).unwrap();
        h.pipeline.flush_once().await;
        assert_eq!(nearby(&h, 1.0, 1.0).await.len(), 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let report = h.pipeline.flush_once().await;
        assert_eq!(report.pruned, 1);
        assert!(nearby(&h, 1.0, 1.0).await.is_empty());
        assert!(presence(&h, &d).await.is_none());
    }

    #[tokio::test]
    async fn full_driver_buffer_triggers_early_flush() {
        let h = harness(IngestConfig {
            flush_interval_ms: 60_000,
            max_samples_per_driver: 2,
            ..config()
        });
        h.pipeline.start();
        let d = DriverId::new();
        h.pipeline.submit(d, at(1.0, 1.0, 0)).unwrap();
        h.pipeline.submit(d, at(1.0, 1.0, 1)).unwrap();

        for _ in 0..50 {
            if h.pipeline.stats().early_flushes > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.pipeline.stats().early_flushes, 1);
        assert!(presence(&h, &d).await.is_some());
        h.pipeline.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_buffer_and_persist_queue() {
        let h = harness(IngestConfig {
            flush_interval_ms: 60_000,
            ..config()
        });
        h.pipeline.start();
        let d = DriverId::new();
        h.pipeline.submit(d, at(1.0, 1.0, 0)).unwrap();

        let report = h.pipeline.stop().await;
        assert_eq!(report.drivers, 1);
        assert!(presence(&h, &d).await.is_some());
        assert_eq!(h.store.count().unwrap(), 1);

        assert_eq!(
            h.pipeline.submit(d, at(1.0, 1.0, 1)).unwrap_err(),
            SubmitError::ShuttingDown
        );
        // Second stop is a no-op.
        assert_eq!(h.pipeline.stop().await, FlushReport::default());
    }
}
