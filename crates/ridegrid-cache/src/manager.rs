//! CacheManager — JSON-encoded values in the shared KV store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ridegrid_core::RequestContext;
use ridegrid_state::{KeyScan, KvStore};

use crate::error::{CacheError, CacheResult};

/// Deadline for the detached write that follows a successful load.
const FILL_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// A value plus whether it came from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub hit: bool,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub load_failures: AtomicU64,
    pub backend_errors: AtomicU64,
    pub write_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub load_failures: u64,
    pub backend_errors: u64,
    pub write_failures: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Bytes produced by the in-flight load for a key, shared with waiters.
type FillSlot = Arc<tokio::sync::Mutex<Option<Vec<u8>>>>;

struct InflightEntry {
    slot: FillSlot,
    users: usize,
}

type InflightMap = Arc<Mutex<HashMap<String, InflightEntry>>>;

/// One caller's claim on a key's fill slot. The entry leaves the map when
/// the last claim drops, including when the caller's future is cancelled
/// mid-load.
struct SlotClaim {
    inflight: InflightMap,
    key: String,
    slot: FillSlot,
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = inflight.get_mut(&self.key) {
            if Arc::ptr_eq(&entry.slot, &self.slot) {
                entry.users -= 1;
                if entry.users == 0 {
                    inflight.remove(&self.key);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct CacheManager {
    kv: Arc<dyn KvStore>,
    scan_page_size: usize,
    inflight: InflightMap,
    stats: Arc<CacheStats>,
}

fn encode<T: Serialize>(value: &T) -> CacheResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| CacheError::Encode(e.to_string()))
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> CacheResult<T> {
    serde_json::from_slice(raw).map_err(|e| CacheError::Decode(e.to_string()))
}

impl CacheManager {
    pub fn new(kv: Arc<dyn KvStore>, scan_page_size: usize) -> Self {
        Self {
            kv,
            scan_page_size: scan_page_size.max(1),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn get<T: DeserializeOwned>(&self, ctx: &RequestContext, key: &str) -> CacheResult<Option<T>> {
        match self.kv.get_bytes(ctx, key).await? {
            Some(raw) => decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<()> {
        let raw = encode(value)?;
        self.kv.set_with_ttl(ctx, key, &raw, ttl).await?;
        Ok(())
    }

    /// Return the cached value for `key`, or run `loader` and cache its
    /// success for `ttl`. Loader errors are returned as-is and never cached.
    ///
    /// Concurrent misses for the same key in this process wait for the first
    /// loader instead of running their own. Cache backend errors degrade to
    /// a miss.
    pub async fn get_or_set<T, E, F, Fut>(
        &self,
        ctx: &RequestContext,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.lookup(ctx, key).await {
            return Ok(Cached { value, hit: true });
        }

        let claim = self.claim_slot(key);
        let slot = Arc::clone(&claim.slot);
        let mut filled = slot.lock().await;
        if let Some(raw) = filled.as_ref() {
            if let Ok(value) = decode::<T>(raw) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Cached { value, hit: true });
            }
        }
        if let Some(value) = self.lookup(ctx, key).await {
            return Ok(Cached { value, hit: true });
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        match loader().await {
            Ok(value) => {
                match encode(&value) {
                    Ok(raw) => {
                        *filled = Some(raw.clone());
                        self.spawn_fill_write(ctx, raw, ttl, claim);
                    }
                    Err(e) => {
                        warn!(key, error = %e, "cache value not encodable, skipping store");
                    }
                }
                Ok(Cached { value, hit: false })
            }
            Err(e) => {
                self.stats.load_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Delete every key matching `pattern`, one SCAN page at a time.
    pub async fn invalidate(&self, ctx: &RequestContext, pattern: &str) -> CacheResult<u64> {
        let mut scan = KeyScan::new(self.kv.as_ref(), pattern, self.scan_page_size);
        let mut removed = 0;
        while let Some(page) = scan.next_page(ctx).await? {
            if !page.is_empty() {
                removed += self.kv.delete(ctx, &page).await?;
            }
        }
        info!(pattern, removed, "cache invalidated");
        Ok(removed)
    }

    async fn lookup<T: DeserializeOwned>(&self, ctx: &RequestContext, key: &str) -> Option<T> {
        match self.kv.get_bytes(ctx, key).await {
            Ok(Some(raw)) => match decode(&raw) {
                Ok(value) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    Some(value)
                }
                Err(e) => {
                    warn!(key, error = %e, "undecodable cache entry treated as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.stats.backend_errors.fetch_add(1, Ordering::Relaxed);
                debug!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    fn claim_slot(&self, key: &str) -> SlotClaim {
        let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        let entry = inflight.entry(key.to_string()).or_insert_with(|| InflightEntry {
            slot: FillSlot::default(),
            users: 0,
        });
        entry.users += 1;
        SlotClaim {
            inflight: Arc::clone(&self.inflight),
            key: key.to_string(),
            slot: Arc::clone(&entry.slot),
        }
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Store the loaded bytes without making the caller wait. The claim
    /// moves into the write task so late waiters still share the load.
    fn spawn_fill_write(&self, ctx: &RequestContext, raw: Vec<u8>, ttl: Duration, claim: SlotClaim) {
        let kv = Arc::clone(&self.kv);
        let stats = Arc::clone(&self.stats);
        // Detached from the caller's cancellation: the answer is already computed.
        let write_ctx = RequestContext::new(ctx.request_id().to_string())
            .with_deadline(Instant::now() + FILL_WRITE_TIMEOUT);
        tokio::spawn(async move {
            if let Err(e) = kv.set_with_ttl(&write_ctx, &claim.key, &raw, ttl).await {
                stats.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %claim.key, error = %e, "cache fill write failed");
            }
            drop(claim);
        });
    }
}
