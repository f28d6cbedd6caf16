//! Flush cadence under KV failures.

use std::time::Duration;

use tracing::{info, warn};

use ridegrid_core::config::IngestConfig;

/// Tracks consecutive failed flushes and widens the flush interval once the
/// pipeline is degraded.
#[derive(Debug)]
pub struct FlushTracker {
    /// Consecutive failed flushes.
    consecutive_failures: u32,
    /// Failures before the pipeline counts as degraded.
    degraded_after: u32,
    degraded: bool,
    /// Normal flush interval.
    base_interval: Duration,
    /// Interval in effect right now.
    current_interval: Duration,
    max_interval: Duration,
}

impl FlushTracker {
    pub fn new(config: &IngestConfig) -> Self {
        Self::with_limits(
            config.degraded_after_failures,
            config.flush_interval(),
            config.max_flush_backoff(),
        )
    }

    pub fn with_limits(degraded_after: u32, base_interval: Duration, max_interval: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            degraded_after: degraded_after.max(1),
            degraded: false,
            base_interval,
            current_interval: base_interval,
            max_interval: max_interval.max(base_interval),
        }
    }

    /// A flush wrote at least one driver.
    pub fn record_success(&mut self) {
        if self.degraded {
            info!(
                failures = self.consecutive_failures,
                "ingest flush recovered, leaving degraded mode"
            );
        }
        self.consecutive_failures = 0;
        self.degraded = false;
        self.current_interval = self.base_interval;
    }

    /// A flush had work and every driver write failed. Returns whether the
    /// pipeline is now degraded.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures < self.degraded_after {
            return false;
        }
        // Exponential backoff: double the interval up to max.
        self.current_interval = (self.current_interval * 2).min(self.max_interval);
        if !self.degraded {
            warn!(
                failures = self.consecutive_failures,
                threshold = self.degraded_after,
                interval_ms = self.current_interval.as_millis() as u64,
                "ingest pipeline degraded, backing off flushes"
            );
        }
        self.degraded = true;
        true
    }

    pub fn next_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> FlushTracker {
        FlushTracker::with_limits(3, Duration::from_secs(1), Duration::from_secs(30))
    }

    #[test]
    fn stays_normal_under_threshold() {
        let mut t = tracker();
        assert!(!t.record_failure());
        assert!(!t.record_failure());
        assert!(!t.is_degraded());
        assert_eq!(t.next_interval(), Duration::from_secs(1));
    }

    #[test]
    fn degrades_at_threshold_and_backs_off_to_cap() {
        let mut t = tracker();
        t.record_failure();
        t.record_failure();
        assert!(t.record_failure());
        assert_eq!(t.next_interval(), Duration::from_secs(2));
        t.record_failure();
        assert_eq!(t.next_interval(), Duration::from_secs(4));
        for _ in 0..10 {
            t.record_failure();
        }
        assert_eq!(t.next_interval(), Duration::from_secs(30));
        assert_eq!(t.consecutive_failures(), 14);
    }

    #[test]
    fn first_success_recovers() {
        let mut t = tracker();
        for _ in 0..5 {
            t.record_failure();
        }
        assert!(t.is_degraded());
        t.record_success();
        assert!(!t.is_degraded());
        assert_eq!(t.consecutive_failures(), 0);
        assert_eq!(t.next_interval(), Duration::from_secs(1));
    }
}
