//! Bounded, jittered retry for idempotent I/O.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound of the random delay added on top of `base_delay`.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            jitter: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.base_delay + Duration::from_millis(extra)
    }
}

/// Run `op` up to `policy.max_attempts` times, retrying only errors for which
/// `retryable` returns true. The last error is returned unchanged.
pub async fn retry<T, E, F, Fut, R>(policy: &RetryPolicy, mut op: F, retryable: R) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && retryable(&e) => {
                debug!(attempt, error = %e, "retrying transient failure");
                tokio::time::sleep(policy.delay()).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            jitter: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn recovers_on_second_attempt() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out: Result<u32, String> = retry(
            &fast(),
            || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("flaky".to_string())
                } else {
                    Ok(9)
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(out, Ok(9));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out: Result<(), String> = retry(
            &fast(),
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            },
            |_| true,
        )
        .await;
        assert_eq!(out, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out: Result<(), String> = retry(
            &fast(),
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("bad request".to_string())
            },
            |e| e != "bad request",
        )
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_stays_within_jitter() {
        let policy = fast();
        for _ in 0..20 {
            let d = policy.delay();
            assert!(d >= Duration::from_millis(1) && d <= Duration::from_millis(2));
        }
    }
}
