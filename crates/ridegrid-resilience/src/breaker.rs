//! Per-dependency circuit breaker.
//!
//! State transitions are serialized behind a short-lived mutex that is
//! never held across an await point, so a breaker can be shared by every
//! task that talks to the same dependency.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ridegrid_core::config::BreakerConfig;

/// Lets the breaker tell caller cancellation apart from dependency failure.
pub trait Failure {
    /// Cancellations pass through without touching breaker state.
    fn is_cancellation(&self) -> bool {
        false
    }
}

/// Outcome of a guarded call that did not produce a value.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker refused to admit the call.
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    /// The wrapped operation failed (or was cancelled).
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_window: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(cfg: &BreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            success_threshold: cfg.success_threshold.max(1),
            open_timeout: cfg.open_timeout(),
            half_open_window: cfg.half_open_window.max(1),
        }
    }
}

/// Point-in-time view of a breaker, for introspection endpoints and metrics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_for_ms: Option<u64>,
    pub opened_total: u64,
    pub rejected_total: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
    pub half_open_window: u32,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Closed,
    Trial,
}

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
    opened_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                trials_in_flight: 0,
            }),
            opened_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Stored state. An Open breaker whose timeout has elapsed still reports
    /// Open until the next call moves it to HalfOpen.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Run `f` if the breaker admits it.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Failure,
    {
        self.call_or_else(f, Err).await
    }

    /// Run `f` if admitted. `fallback` supplies the result when the breaker
    /// rejects the call, or when `f` fails while the breaker is Closed.
    /// A failed half-open trial and any cancellation are returned as-is.
    pub async fn call_or_else<T, E, F, Fut, G>(&self, f: F, fallback: G) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(BreakerError<E>) -> Result<T, BreakerError<E>>,
        E: Failure,
    {
        let Some(permit) = self.try_acquire() else {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            return fallback(BreakerError::Open {
                name: self.name.clone(),
            });
        };

        let mut guard = PermitGuard {
            breaker: self,
            permit,
            settled: false,
        };

        match f().await {
            Ok(value) => {
                guard.settle(Outcome::Success);
                Ok(value)
            }
            Err(e) if e.is_cancellation() => {
                guard.settle(Outcome::Released);
                Err(BreakerError::Inner(e))
            }
            Err(e) => {
                guard.settle(Outcome::Failure);
                match permit {
                    Permit::Closed => fallback(BreakerError::Inner(e)),
                    Permit::Trial => Err(BreakerError::Inner(e)),
                }
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            open_for_ms: inner
                .opened_at
                .filter(|_| inner.state == BreakerState::Open)
                .map(|at| at.elapsed().as_millis() as u64),
            opened_total: self.opened_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            failure_threshold: self.settings.failure_threshold,
            success_threshold: self.settings.success_threshold,
            open_timeout_ms: self.settings.open_timeout.as_millis() as u64,
            half_open_window: self.settings.half_open_window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_acquire(&self) -> Option<Permit> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Some(Permit::Closed),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.settings.open_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.trials_in_flight = 1;
                    debug!(breaker = %self.name, "circuit breaker half-open");
                    Some(Permit::Trial)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                if inner.trials_in_flight < self.settings.half_open_window {
                    inner.trials_in_flight += 1;
                    Some(Permit::Trial)
                } else {
                    None
                }
            }
        }
    }

    fn record(&self, permit: Permit, outcome: Outcome) {
        let mut inner = self.lock();
        if permit == Permit::Trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }

        match (outcome, inner.state) {
            (Outcome::Released, _) => {}
            (Outcome::Success, BreakerState::Closed) => {
                inner.consecutive_failures = 0;
            }
            (Outcome::Success, BreakerState::HalfOpen) => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.settings.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                    info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            (Outcome::Failure, BreakerState::Closed) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            (Outcome::Failure, BreakerState::HalfOpen) => {
                inner.consecutive_failures += 1;
                self.trip(&mut inner);
            }
            // Late results from calls admitted before the breaker opened.
            (_, BreakerState::Open) => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.consecutive_successes = 0;
        self.opened_total.fetch_add(1, Ordering::Relaxed);
        warn!(
            breaker = %self.name,
            failures = inner.consecutive_failures,
            threshold = self.settings.failure_threshold,
            "circuit breaker opened"
        );
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    /// Caller cancelled; frees the trial slot without a verdict.
    Released,
}

/// Releases a half-open trial slot if the guarded future is dropped mid-call.
struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    settled: bool,
}

impl PermitGuard<'_> {
    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.permit, outcome);
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(self.permit, Outcome::Released);
        }
    }
}

/// Named breakers, one per logical dependency, shared for the process lifetime.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the breaker registered under `name`, creating it with `settings`
    /// on first use. Later calls ignore `settings`.
    pub fn get_or_insert(&self, name: &str, settings: BreakerSettings) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut breakers = self
            .breakers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, settings))),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|b| b.snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Boom,
        Cancelled,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Failure for TestError {
        fn is_cancellation(&self) -> bool {
            matches!(self, TestError::Cancelled)
        }
    }

    fn settings(failures: u32, successes: u32, open_ms: u64, window: u32) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: failures,
            success_threshold: successes,
            open_timeout: Duration::from_millis(open_ms),
            half_open_window: window,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<TestError>> {
        cb.call(|| async { Err::<(), _>(TestError::Boom) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, BreakerError<TestError>> {
        cb.call(|| async { Ok::<_, TestError>(1) }).await
    }

    #[tokio::test]
    async fn closed_allows_calls() {
        let cb = CircuitBreaker::new("dep", settings(3, 1, 1000, 1));
        assert_eq!(succeed(&cb).await.unwrap(), 1);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let cb = CircuitBreaker::new("dep", settings(5, 1, 60_000, 1));
        for _ in 0..5 {
            assert!(matches!(fail(&cb).await, Err(BreakerError::Inner(TestError::Boom))));
        }
        assert_eq!(cb.state(), BreakerState::Open);

        let invoked = AtomicU32::new(0);
        let counter = &invoked;
        let started = std::time::Instant::now();
        let result = cb
            .call(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, TestError>(())
            })
            .await;
        assert!(result.unwrap_err().is_open());
        assert!(started.elapsed() < Duration::from_millis(10));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.snapshot().rejected_total, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let cb = CircuitBreaker::new("dep", settings(3, 1, 60_000, 1));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn half_open_needs_success_threshold_to_close() {
        let cb = CircuitBreaker::new("dep", settings(1, 2, 10, 1));
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new("dep", settings(1, 1, 10, 1));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(succeed(&cb).await.unwrap_err().is_open());
        assert_eq!(cb.snapshot().opened_total, 2);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_trials() {
        let cb = Arc::new(CircuitBreaker::new("dep", settings(1, 1, 10, 1)));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = Arc::clone(&cb);
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, TestError>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        // Window of one is taken by the in-flight trial.
        assert!(succeed(&cb).await.unwrap_err().is_open());

        let _ = release_tx.send(());
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn cancellation_does_not_count() {
        let cb = CircuitBreaker::new("dep", settings(1, 1, 60_000, 1));
        let result = cb.call(|| async { Err::<(), _>(TestError::Cancelled) }).await;
        assert!(matches!(result, Err(BreakerError::Inner(TestError::Cancelled))));
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn dropped_trial_frees_its_slot() {
        let cb = CircuitBreaker::new("dep", settings(1, 1, 10, 1));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let slow = cb.call(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, TestError>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), slow).await;
        assert!(timed_out.is_err());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn fallback_covers_open_and_closed_failures() {
        let cb = CircuitBreaker::new("dep", settings(2, 1, 60_000, 1));

        let first = cb
            .call_or_else(|| async { Err::<&str, _>(TestError::Boom) }, |_| Ok("fallback"))
            .await;
        assert_eq!(first.unwrap(), "fallback");

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), BreakerState::Open);

        let rejected = cb
            .call_or_else(
                || async { Ok::<_, TestError>("live") },
                |e| {
                    assert!(e.is_open());
                    Ok("fallback")
                },
            )
            .await;
        assert_eq!(rejected.unwrap(), "fallback");
    }

    #[test]
    fn registry_reuses_instances() {
        let registry = BreakerRegistry::new();
        let a = registry.get_or_insert("geocode", BreakerSettings::default());
        let b = registry.get_or_insert("geocode", settings(1, 1, 1, 1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.settings().failure_threshold, 5);
        registry.get_or_insert("ml_eta", BreakerSettings::default());

        let names: Vec<_> = registry.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["geocode".to_string(), "ml_eta".to_string()]);
    }

    #[test]
    fn settings_from_config_clamp_zeroes() {
        let cfg = BreakerConfig {
            failure_threshold: 0,
            success_threshold: 0,
            open_timeout_ms: 5,
            half_open_window: 0,
        };
        let s = BreakerSettings::from(&cfg);
        assert_eq!(s.failure_threshold, 1);
        assert_eq!(s.success_threshold, 1);
        assert_eq!(s.half_open_window, 1);
    }
}
