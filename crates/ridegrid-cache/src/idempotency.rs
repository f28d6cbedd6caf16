//! Idempotency records for mutating HTTP requests.
//!
//! A record is keyed by a hash of `(caller identity, Idempotency-Key)` and
//! stores the fingerprint of the request that produced it plus the
//! response to replay. Concurrent first attempts elect one executor with
//! `SET NX`; the others poll for a bounded time and then replay or give up.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ridegrid_core::RequestContext;
use ridegrid_core::config::IdempotencyConfig;
use ridegrid_state::{KeySpace, KvStore};

use crate::error::{CacheError, CacheResult};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// SHA-256 over `method ∥ route ∥ body`, hex encoded. Fields are separated
/// by a zero byte so distinct triples cannot collide by concatenation.
pub fn fingerprint(method: &str, route: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update([0u8]);
    hasher.update(route.as_bytes());
    hasher.update([0u8]);
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Stable hash of the record scope, used as the KV key suffix.
pub fn scope_hash(caller: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(caller.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub fingerprint: String,
    pub status: u16,
    /// Replayed subset of the original response headers.
    pub headers: Vec<(String, String)>,
    #[serde(with = "hex_bytes")]
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}

/// What the caller should do with a keyed request.
#[derive(Debug, Clone, PartialEq)]
pub enum Begin {
    /// This caller won the election; run the handler, then `complete` or `abandon`.
    Execute,
    /// A stored response with the same fingerprint exists.
    Replay(IdempotencyRecord),
    /// The key was already used for a different payload.
    Mismatch,
    /// Another request with this key is still running past the wait budget.
    InProgress,
}

#[derive(Debug, Clone)]
pub struct IdempotencySettings {
    pub ttl: Duration,
    pub wait: Duration,
    pub lock_ttl: Duration,
}

impl From<&IdempotencyConfig> for IdempotencySettings {
    fn from(cfg: &IdempotencyConfig) -> Self {
        Self {
            ttl: cfg.ttl(),
            wait: cfg.wait(),
            lock_ttl: cfg.lock_ttl(),
        }
    }
}

#[derive(Clone)]
pub struct IdempotencyStore {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    settings: IdempotencySettings,
}

impl IdempotencyStore {
    pub fn new(kv: Arc<dyn KvStore>, keys: KeySpace, settings: IdempotencySettings) -> Self {
        Self { kv, keys, settings }
    }

    pub async fn lookup(&self, ctx: &RequestContext, scope: &str) -> CacheResult<Option<IdempotencyRecord>> {
        match self.kv.get_bytes(ctx, &self.keys.idempotency(scope)).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| CacheError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn begin(&self, ctx: &RequestContext, scope: &str, fingerprint: &str) -> CacheResult<Begin> {
        let lock_key = self.keys.idempotency_lock(scope);
        let give_up_at = Instant::now() + self.settings.wait;
        loop {
            if let Some(record) = self.lookup(ctx, scope).await? {
                return Ok(if record.fingerprint == fingerprint {
                    debug!(scope, "idempotent replay");
                    Begin::Replay(record)
                } else {
                    Begin::Mismatch
                });
            }

            let elected = self
                .kv
                .set_if_absent(ctx, &lock_key, fingerprint.as_bytes(), self.settings.lock_ttl)
                .await?;
            if elected {
                return Ok(Begin::Execute);
            }

            // The in-flight holder stores its fingerprint in the lock.
            if let Some(holder) = self.kv.get_string(ctx, &lock_key).await? {
                if holder != fingerprint {
                    return Ok(Begin::Mismatch);
                }
            }

            if Instant::now() + POLL_INTERVAL > give_up_at {
                info!(scope, "idempotent request still in progress");
                return Ok(Begin::InProgress);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Persist a successful response and release the election.
    pub async fn complete(&self, ctx: &RequestContext, scope: &str, record: &IdempotencyRecord) -> CacheResult<()> {
        let raw = serde_json::to_vec(record).map_err(|e| CacheError::Encode(e.to_string()))?;
        self.kv
            .set_with_ttl(ctx, &self.keys.idempotency(scope), &raw, self.settings.ttl)
            .await?;
        self.release(ctx, scope).await;
        Ok(())
    }

    /// Release the election without storing anything, e.g. for non-2xx responses.
    pub async fn abandon(&self, ctx: &RequestContext, scope: &str) {
        self.release(ctx, scope).await;
    }

    async fn release(&self, ctx: &RequestContext, scope: &str) {
        if let Err(e) = self.kv.delete(ctx, &[self.keys.idempotency_lock(scope)]).await {
            // The lock TTL bounds how long this can block retries.
            warn!(scope, error = %e, "failed to release idempotency lock");
        }
    }
}
