//! ridegrid-resilience — the failure-handling primitives shared by ingest,
//! geo query, geocoding, and ETA tracking.
//!
//! # Architecture
//!
//! ```text
//! CircuitBreaker (one per named dependency, held in a BreakerRegistry)
//!   ├── Closed   → calls run; consecutive failures counted
//!   ├── Open     → calls fail fast until open_timeout elapses
//!   └── HalfOpen → at most half_open_window concurrent trial calls
//!
//! retry()          ≤ 2 attempts, jittered, idempotent operations only
//! JsonHttpClient   hyper client; per-call deadline from RequestContext,
//!                  X-Request-ID forwarded on every outbound call
//! ```
//!
//! Retries live only at the narrowest I/O boundary. Callers above that
//! boundary never loop.

pub mod breaker;
pub mod http;
pub mod retry;

pub use breaker::{
    BreakerError, BreakerRegistry, BreakerSettings, BreakerSnapshot, BreakerState, CircuitBreaker,
    Failure,
};
pub use http::{HttpError, JsonHttpClient, REQUEST_ID_HEADER};
pub use retry::{retry, RetryPolicy};
