//! ridegrid-state — storage adapters for the ridegrid data plane.
//!
//! Two very different stores live here:
//!
//! ```text
//! KvStore (trait)                     SampleStore (redb)
//!   ├── MemoryKv   tests, single node   location_samples
//!   └── RedisKv    production             key = {driver_id}:{recorded_at_ms:020}
//!
//! strings + TTL, SETNX, INCR          durable, append-mostly history;
//! geo index add / radius / remove     written in bulk by the ingest
//! sorted sets, capped lists, SCAN     persistence loop via SampleSink
//! ```
//!
//! The KV store is process-external and linearizable per key; nothing in
//! this crate adds application-side locking on top of it.

pub mod error;
pub mod keys;
pub mod kv;
pub mod memory;
pub mod redis_kv;
pub mod sink;
pub mod store;
pub mod tables;

pub use error::{KvError, KvResult, StateError, StateResult};
pub use keys::KeySpace;
pub use kv::{GeoHit, KeyScan, KvStore};
pub use memory::MemoryKv;
pub use redis_kv::RedisKv;
pub use sink::SampleSink;
pub use store::SampleStore;
