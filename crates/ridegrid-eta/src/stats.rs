//! Tracker counters. Lock-free; read with [`TrackerStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct TrackerStats {
    started: AtomicU64,
    stopped: AtomicU64,
    ticks: AtomicU64,
    missed_ticks: AtomicU64,
    /// Ticks cancelled for exceeding the tick budget (also counted as missed).
    tick_timeouts: AtomicU64,
    tick_panics: AtomicU64,
    publishes: AtomicU64,
    publish_failures: AtomicU64,
    stale_rides: AtomicU64,
    reaped: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStatsSnapshot {
    pub started: u64,
    pub stopped: u64,
    pub ticks: u64,
    pub missed_ticks: u64,
    pub tick_timeouts: u64,
    pub tick_panics: u64,
    pub publishes: u64,
    pub publish_failures: u64,
    pub stale_rides: u64,
    pub reaped: u64,
    pub active_rides: u64,
}

impl TrackerStats {
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_missed(&self) {
        self.missed_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.tick_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.tick_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self, ok: bool) {
        let counter = if ok { &self.publishes } else { &self.publish_failures };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_rides.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reaped(&self, n: u64) {
        self.reaped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_rides: u64) -> TrackerStatsSnapshot {
        TrackerStatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            stopped: self.stopped.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            missed_ticks: self.missed_ticks.load(Ordering::Relaxed),
            tick_timeouts: self.tick_timeouts.load(Ordering::Relaxed),
            tick_panics: self.tick_panics.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            stale_rides: self.stale_rides.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            active_rides,
        }
    }
}
