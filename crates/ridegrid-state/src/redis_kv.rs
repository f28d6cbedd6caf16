//! Redis-backed [`KvStore`].
//!
//! One auto-reconnecting connection manager per process, created on first
//! use. Each command runs under the caller's context with the configured
//! per-op timeout; read-only and naturally idempotent commands get one
//! jittered retry, everything else runs exactly once.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Cmd, FromRedisValue, Pipeline, RedisError};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use ridegrid_core::RequestContext;
use ridegrid_resilience::{retry, RetryPolicy};

use crate::error::{KvError, KvResult};
use crate::kv::{GeoHit, KvStore};

fn classify(e: RedisError) -> KvError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        KvError::Connect(e.to_string())
    } else {
        KvError::Command(e.to_string())
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

pub struct RedisKv {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    op_timeout: Duration,
    retry: RetryPolicy,
}

impl RedisKv {
    /// Validate the URL; no connection is made until the first command.
    pub fn new(url: &str, op_timeout: Duration) -> KvResult<Self> {
        let client = redis::Client::open(url).map_err(|e| KvError::Connect(e.to_string()))?;
        info!(url, "redis kv configured");
        Ok(Self {
            client,
            conn: OnceCell::new(),
            op_timeout,
            retry: RetryPolicy::default(),
        })
    }

    async fn connection(&self) -> KvResult<ConnectionManager> {
        self.conn
            .get_or_try_init(|| async {
                debug!("opening redis connection manager");
                ConnectionManager::new(self.client.clone()).await.map_err(classify)
            })
            .await
            .cloned()
    }

    async fn exec<T>(&self, ctx: &RequestContext, cmd: &Cmd, idempotent: bool) -> KvResult<T>
    where
        T: FromRedisValue + Send,
    {
        let policy = if idempotent {
            self.retry
        } else {
            RetryPolicy::no_retry()
        };
        retry(
            &policy,
            || async move {
                let mut conn = self.connection().await?;
                let outcome = ctx
                    .run(self.op_timeout, async {
                        let reply: redis::RedisResult<T> = cmd.query_async(&mut conn).await;
                        reply
                    })
                    .await?;
                outcome.map_err(classify)
            },
            KvError::is_retryable,
        )
        .await
    }

    async fn exec_pipeline(&self, ctx: &RequestContext, pipe: &Pipeline) -> KvResult<()> {
        let mut conn = self.connection().await?;
        let outcome = ctx
            .run(self.op_timeout, async {
                let reply: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
                reply
            })
            .await?;
        outcome.map_err(classify)
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get_bytes(&self, ctx: &RequestContext, key: &str) -> KvResult<Option<Vec<u8>>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.exec(ctx, &cmd, true).await
    }

    async fn set_with_ttl(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> KvResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(ttl_ms(ttl));
        self.exec(ctx, &cmd, true).await
    }

    async fn set_if_absent(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> KvResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(ttl_ms(ttl));
        let reply: Option<String> = self.exec(ctx, &cmd, false).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, ctx: &RequestContext, keys: &[String]) -> KvResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.exec(ctx, &cmd, true).await
    }

    async fn incr(&self, ctx: &RequestContext, key: &str) -> KvResult<i64> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(key);
        self.exec(ctx, &cmd, false).await
    }

    async fn expire(&self, ctx: &RequestContext, key: &str, ttl: Duration) -> KvResult<bool> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(ttl_ms(ttl));
        self.exec(ctx, &cmd, true).await
    }

    async fn geo_add(
        &self,
        ctx: &RequestContext,
        index: &str,
        member: &str,
        lat: f64,
        lon: f64,
    ) -> KvResult<()> {
        let mut cmd = redis::cmd("GEOADD");
        cmd.arg(index).arg(lon).arg(lat).arg(member);
        let _added: i64 = self.exec(ctx, &cmd, true).await?;
        Ok(())
    }

    async fn geo_radius(
        &self,
        ctx: &RequestContext,
        index: &str,
        lat: f64,
        lon: f64,
        radius_m: f64,
        limit: usize,
    ) -> KvResult<Vec<GeoHit>> {
        let mut cmd = redis::cmd("GEOSEARCH");
        cmd.arg(index)
            .arg("FROMLONLAT")
            .arg(lon)
            .arg(lat)
            .arg("BYRADIUS")
            .arg(radius_m)
            .arg("m")
            .arg("ASC")
            .arg("COUNT")
            .arg(limit.max(1))
            .arg("WITHDIST");
        let rows: Vec<(String, f64)> = self.exec(ctx, &cmd, true).await?;
        Ok(rows
            .into_iter()
            .map(|(member, distance_m)| GeoHit { member, distance_m })
            .collect())
    }

    async fn geo_remove(&self, ctx: &RequestContext, index: &str, member: &str) -> KvResult<bool> {
        // Geo sets are sorted sets underneath.
        let mut cmd = redis::cmd("ZREM");
        cmd.arg(index).arg(member);
        let removed: i64 = self.exec(ctx, &cmd, true).await?;
        Ok(removed > 0)
    }

    async fn zadd(&self, ctx: &RequestContext, key: &str, member: &str, score: f64) -> KvResult<()> {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key).arg(score).arg(member);
        let _added: i64 = self.exec(ctx, &cmd, true).await?;
        Ok(())
    }

    async fn zrange_below(
        &self,
        ctx: &RequestContext,
        key: &str,
        max: f64,
        limit: usize,
    ) -> KvResult<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg("-inf").arg(max).arg("LIMIT").arg(0).arg(limit);
        self.exec(ctx, &cmd, true).await
    }

    async fn zrem(&self, ctx: &RequestContext, key: &str, members: &[String]) -> KvResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("ZREM");
        cmd.arg(key).arg(members);
        self.exec(ctx, &cmd, true).await
    }

    async fn list_push_trim(
        &self,
        ctx: &RequestContext,
        key: &str,
        values: &[Vec<u8>],
        cap: usize,
        ttl: Duration,
    ) -> KvResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LPUSH")
            .arg(key)
            .arg(values)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(cap.saturating_sub(1))
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms(ttl))
            .ignore();
        // LPUSH is not idempotent; a retry would duplicate history entries.
        self.exec_pipeline(ctx, &pipe).await
    }

    async fn list_range(&self, ctx: &RequestContext, key: &str, limit: usize) -> KvResult<Vec<Vec<u8>>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(0).arg(limit - 1);
        self.exec(ctx, &cmd, true).await
    }

    async fn scan_page(
        &self,
        ctx: &RequestContext,
        pattern: &str,
        cursor: u64,
        page_size: usize,
    ) -> KvResult<(u64, Vec<String>)> {
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(page_size.max(1));
        self.exec(ctx, &cmd, true).await
    }

    async fn ping(&self, ctx: &RequestContext) -> KvResult<()> {
        let reply: String = self.exec(ctx, &redis::cmd("PING"), true).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(KvError::Command(format!("unexpected PING reply: {reply}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url() {
        assert!(matches!(RedisKv::new("not a url", Duration::from_millis(10)), Err(KvError::Connect(_))));
    }

    #[test]
    fn accepts_url_without_connecting() {
        assert!(RedisKv::new("redis://127.0.0.1:1", Duration::from_millis(10)).is_ok());
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        let kv = RedisKv::new("redis://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        let err = kv.ping(&RequestContext::new("t")).await.unwrap_err();
        assert_eq!(err.kind(), ridegrid_core::ErrorKind::Unavailable);
    }

    #[test]
    fn ttl_never_rounds_to_zero() {
        assert_eq!(ttl_ms(Duration::from_micros(10)), 1);
        assert_eq!(ttl_ms(Duration::from_secs(60)), 60_000);
    }
}
