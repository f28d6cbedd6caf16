//! The key/value contract every ridegrid component programs against.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use ridegrid_core::RequestContext;

use crate::error::KvResult;

/// One member returned by a radius query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoHit {
    pub member: String,
    pub distance_m: f64,
}

/// Typed wrapper over a commodity key/value store.
///
/// Every call takes the caller's context and honors its cancellation and
/// deadline. Reads return `Ok(None)` for absent keys; only transport and
/// protocol problems surface as errors.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_bytes(&self, ctx: &RequestContext, key: &str) -> KvResult<Option<Vec<u8>>>;

    async fn get_string(&self, ctx: &RequestContext, key: &str) -> KvResult<Option<String>> {
        match self.get_bytes(ctx, key).await? {
            Some(raw) => String::from_utf8(raw)
                .map(Some)
                .map_err(|e| crate::KvError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> KvResult<()>;

    /// Returns true when this call created the key.
    async fn set_if_absent(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> KvResult<bool>;

    /// Number of keys that existed.
    async fn delete(&self, ctx: &RequestContext, keys: &[String]) -> KvResult<u64>;

    async fn incr(&self, ctx: &RequestContext, key: &str) -> KvResult<i64>;

    /// Returns false when the key does not exist.
    async fn expire(&self, ctx: &RequestContext, key: &str, ttl: Duration) -> KvResult<bool>;

    async fn geo_add(
        &self,
        ctx: &RequestContext,
        index: &str,
        member: &str,
        lat: f64,
        lon: f64,
    ) -> KvResult<()>;

    /// Members within `radius_m`, nearest first, at most `limit`.
    async fn geo_radius(
        &self,
        ctx: &RequestContext,
        index: &str,
        lat: f64,
        lon: f64,
        radius_m: f64,
        limit: usize,
    ) -> KvResult<Vec<GeoHit>>;

    async fn geo_remove(&self, ctx: &RequestContext, index: &str, member: &str) -> KvResult<bool>;

    async fn zadd(&self, ctx: &RequestContext, key: &str, member: &str, score: f64) -> KvResult<()>;

    /// Members with score `<= max`, lowest first, at most `limit`.
    async fn zrange_below(
        &self,
        ctx: &RequestContext,
        key: &str,
        max: f64,
        limit: usize,
    ) -> KvResult<Vec<String>>;

    async fn zrem(&self, ctx: &RequestContext, key: &str, members: &[String]) -> KvResult<u64>;

    /// Prepend `values` (oldest first, so the last one ends up at the head),
    /// trim the list to `cap` entries and refresh its TTL, atomically.
    async fn list_push_trim(
        &self,
        ctx: &RequestContext,
        key: &str,
        values: &[Vec<u8>],
        cap: usize,
        ttl: Duration,
    ) -> KvResult<()>;

    /// Up to `limit` entries from the head (newest first).
    async fn list_range(&self, ctx: &RequestContext, key: &str, limit: usize) -> KvResult<Vec<Vec<u8>>>;

    /// One SCAN page. A returned cursor of 0 means iteration is complete.
    async fn scan_page(
        &self,
        ctx: &RequestContext,
        pattern: &str,
        cursor: u64,
        page_size: usize,
    ) -> KvResult<(u64, Vec<String>)>;

    async fn ping(&self, ctx: &RequestContext) -> KvResult<()>;
}

/// Lazy, page-at-a-time iteration over keys matching a glob pattern.
pub struct KeyScan<'a> {
    kv: &'a dyn KvStore,
    pattern: String,
    page_size: usize,
    cursor: u64,
    done: bool,
}

impl<'a> KeyScan<'a> {
    pub fn new(kv: &'a dyn KvStore, pattern: impl Into<String>, page_size: usize) -> Self {
        Self {
            kv,
            pattern: pattern.into(),
            page_size: page_size.max(1),
            cursor: 0,
            done: false,
        }
    }

    /// Next page of keys, or `None` once the scan has wrapped around.
    /// Pages may be empty while the scan is still in progress.
    pub async fn next_page(&mut self, ctx: &RequestContext) -> KvResult<Option<Vec<String>>> {
        if self.done {
            return Ok(None);
        }
        let (next, keys) = self
            .kv
            .scan_page(ctx, &self.pattern, self.cursor, self.page_size)
            .await?;
        self.cursor = next;
        self.done = next == 0;
        Ok(Some(keys))
    }
}
