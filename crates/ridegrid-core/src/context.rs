//! Per-call context: correlation id, deadline, and cancellation.
//!
//! Every boundary-crossing operation takes a `&RequestContext` first. HTTP
//! handlers build one per request; background loops build a root context
//! from their own shutdown token so a cancelled request never stops them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context-guarded future did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("cancelled by caller")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Clone, Debug)]
pub struct RequestContext {
    request_id: Arc<str>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Context for an inbound request with no deadline of its own.
    pub fn new(request_id: impl Into<Arc<str>>) -> Self {
        Self {
            request_id: request_id.into(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Root context for background work, cancelled only through `cancel`.
    pub fn background(name: &str, cancel: CancellationToken) -> Self {
        Self {
            request_id: Arc::from(format!("bg-{name}")),
            deadline: None,
            cancel,
        }
    }

    /// Replace the deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Child context: the earlier of the current deadline and `now + timeout`,
    /// with a cancellation token that follows the parent's.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            request_id: Arc::clone(&self.request_id),
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Per-call timeout: the component default, shortened by the caller's
    /// remaining budget when that is tighter.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.min(default),
            None => default,
        }
    }

    /// Drive `fut` to completion unless the context is cancelled or the
    /// effective timeout elapses first.
    pub async fn run<F>(&self, default_timeout: Duration, fut: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        if self.cancel.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        let timeout = self.effective_timeout(default_timeout);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            out = tokio::time::timeout(timeout, fut) => out.map_err(|_| Interrupted::DeadlineExceeded),
        }
    }
}
