//! Pipeline counters. Lock-free; read with [`IngestStats::snapshot`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

use crate::error::{QuotaReason, SubmitError};

#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    rejected_invalid: AtomicU64,
    rejected_stale: AtomicU64,
    rejected_rate: AtomicU64,
    rejected_buffer_full: AtomicU64,
    flushes: AtomicU64,
    early_flushes: AtomicU64,
    /// Driver batches whose KV writes failed.
    flush_failures: AtomicU64,
    /// Samples dropped from the buffer after a failed flush.
    requeue_dropped: AtomicU64,
    stale_index_pruned: AtomicU64,
    persisted: AtomicU64,
    /// Samples the durable sink never received.
    persist_dropped: AtomicU64,
    degraded: AtomicBool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub accepted: u64,
    pub rejected_invalid: u64,
    pub rejected_stale: u64,
    pub rejected_rate: u64,
    pub rejected_buffer_full: u64,
    pub flushes: u64,
    pub early_flushes: u64,
    pub flush_failures: u64,
    pub requeue_dropped: u64,
    pub stale_index_pruned: u64,
    pub persisted: u64,
    pub persist_dropped: u64,
    pub degraded: bool,
    pub buffered: u64,
    pub persist_queue: u64,
}

impl IngestStats {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, err: &SubmitError) {
        let counter = match err {
            SubmitError::InvalidPoint(_) => &self.rejected_invalid,
            SubmitError::Stale { .. } => &self.rejected_stale,
            SubmitError::QuotaExceeded(QuotaReason::DriverRate) => &self.rejected_rate,
            SubmitError::QuotaExceeded(QuotaReason::GlobalBuffer) => &self.rejected_buffer_full,
            SubmitError::ShuttingDown => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, early: bool, failed_drivers: u64, requeue_dropped: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        if early {
            self.early_flushes.fetch_add(1, Ordering::Relaxed);
        }
        self.flush_failures.fetch_add(failed_drivers, Ordering::Relaxed);
        self.requeue_dropped.fetch_add(requeue_dropped, Ordering::Relaxed);
    }

    pub fn record_pruned(&self, count: u64) {
        self.stale_index_pruned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, count: u64) {
        self.persisted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_persist_dropped(&self, count: u64) {
        self.persist_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Counters plus the two gauges the caller owns.
    pub fn snapshot(&self, buffered: usize, persist_queue: usize) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_invalid: self.rejected_invalid.load(Ordering::Relaxed),
            rejected_stale: self.rejected_stale.load(Ordering::Relaxed),
            rejected_rate: self.rejected_rate.load(Ordering::Relaxed),
            rejected_buffer_full: self.rejected_buffer_full.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            early_flushes: self.early_flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            requeue_dropped: self.requeue_dropped.load(Ordering::Relaxed),
            stale_index_pruned: self.stale_index_pruned.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            persist_dropped: self.persist_dropped.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            buffered: buffered as u64,
            persist_queue: persist_queue as u64,
        }
    }
}
