//! ridegrid-cache — typed caching and idempotency records on top of the
//! shared KV store.
//!
//! ```text
//! CacheManager
//!   get / set          JSON-encoded values, TTL on every write
//!   get_or_set         concurrent misses on one key share a single load;
//!                      the KV write happens off the caller's path
//!   invalidate         paged SCAN + DEL, maintenance only
//!
//! IdempotencyStore
//!   begin              replay | mismatch | execute (SETNX election) | in-progress
//!   complete / abandon persist a 2xx response, or release the election
//! ```
//!
//! Negative results are never cached: a failed loader leaves the key absent.

pub mod error;
pub mod idempotency;
pub mod manager;

pub use error::{CacheError, CacheResult};
pub use idempotency::{
    fingerprint, scope_hash, Begin, IdempotencyRecord, IdempotencySettings, IdempotencyStore,
};
pub use manager::{CacheManager, CacheStats, CacheStatsSnapshot, Cached};
