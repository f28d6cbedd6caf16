//! In-process [`KvStore`] for tests and single-node deployments.
//!
//! TTLs are enforced lazily on access. Geo radius queries are a linear scan
//! with haversine distance, which is fine for the index sizes this backend
//! is meant for.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use ridegrid_core::RequestContext;
use ridegrid_core::geo::haversine_m;

use crate::error::{KvError, KvResult};
use crate::kv::{GeoHit, KvStore};

struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct Data {
    strings: HashMap<String, Expiring<Vec<u8>>>,
    lists: HashMap<String, Expiring<VecDeque<Vec<u8>>>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    geo: HashMap<String, HashMap<String, (f64, f64)>>,
}

impl Data {
    fn purge_expired(&mut self, now: Instant) {
        self.strings.retain(|_, e| e.live(now));
        self.lists.retain(|_, e| e.live(now));
    }

    fn live_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .strings
            .keys()
            .chain(self.lists.keys())
            .chain(self.zsets.keys())
            .chain(self.geo.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

#[derive(Default)]
pub struct MemoryKv {
    data: Mutex<Data>,
    failing: AtomicBool,
    poisoned: Mutex<Vec<String>>,
    ops: AtomicU64,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a transport error until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail writes to any key or member containing `fragment`.
    pub fn poison(&self, fragment: impl Into<String>) {
        self.poisoned
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(fragment.into());
    }

    pub fn clear_poison(&self) {
        self.poisoned.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn check_poison(&self, names: &[&str]) -> KvResult<()> {
        let poisoned = self.poisoned.lock().unwrap_or_else(|p| p.into_inner());
        match names
            .iter()
            .find(|name| poisoned.iter().any(|frag| name.contains(frag.as_str())))
        {
            Some(name) => Err(KvError::Command(format!("injected failure for {name}"))),
            None => Ok(()),
        }
    }

    /// Total operations attempted, including failed ones.
    pub fn op_count(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    fn lock(&self, ctx: &RequestContext) -> KvResult<MutexGuard<'_, Data>> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        if ctx.is_cancelled() {
            return Err(KvError::Cancelled);
        }
        if ctx.remaining().is_some_and(|left| left.is_zero()) {
            return Err(KvError::Timeout);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(KvError::Connect("injected failure".to_string()));
        }
        let mut data = self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        data.purge_expired(Instant::now());
        Ok(data)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get_bytes(&self, ctx: &RequestContext, key: &str) -> KvResult<Option<Vec<u8>>> {
        let data = self.lock(ctx)?;
        Ok(data.strings.get(key).map(|e| e.value.clone()))
    }

    async fn set_with_ttl(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> KvResult<()> {
        let mut data = self.lock(ctx)?;
        self.check_poison(&[key])?;
        data.strings.insert(
            key.to_string(),
            Expiring {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> KvResult<bool> {
        let mut data = self.lock(ctx)?;
        if data.strings.contains_key(key) {
            return Ok(false);
        }
        data.strings.insert(
            key.to_string(),
            Expiring {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, ctx: &RequestContext, keys: &[String]) -> KvResult<u64> {
        let mut data = self.lock(ctx)?;
        let mut removed = 0;
        for key in keys {
            let existed = data.strings.remove(key).is_some()
                | data.lists.remove(key).is_some()
                | data.zsets.remove(key).is_some()
                | data.geo.remove(key).is_some();
            if existed {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn incr(&self, ctx: &RequestContext, key: &str) -> KvResult<i64> {
        let mut data = self.lock(ctx)?;
        let entry = data.strings.entry(key.to_string()).or_insert(Expiring {
            value: b"0".to_vec(),
            expires_at: None,
        });
        let current: i64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| KvError::Command("value is not an integer".to_string()))?;
        let next = current + 1;
        entry.value = next.to_string().into_bytes();
        Ok(next)
    }

    async fn expire(&self, ctx: &RequestContext, key: &str, ttl: Duration) -> KvResult<bool> {
        let mut data = self.lock(ctx)?;
        let at = Some(Instant::now() + ttl);
        if let Some(e) = data.strings.get_mut(key) {
            e.expires_at = at;
            return Ok(true);
        }
        if let Some(e) = data.lists.get_mut(key) {
            e.expires_at = at;
            return Ok(true);
        }
        Ok(false)
    }

    async fn geo_add(
        &self,
        ctx: &RequestContext,
        index: &str,
        member: &str,
        lat: f64,
        lon: f64,
    ) -> KvResult<()> {
        let mut data = self.lock(ctx)?;
        self.check_poison(&[index, member])?;
        data.geo
            .entry(index.to_string())
            .or_default()
            .insert(member.to_string(), (lat, lon));
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
        let data = self.lock(ctx)?;
        let Some(members) = data.geo.get(index) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<GeoHit> = members
            .iter()
            .map(|(member, &(mlat, mlon))| GeoHit {
                member: member.clone(),
                distance_m: haversine_m(lat, lon, mlat, mlon),
            })
            .filter(|hit| hit.distance_m <= radius_m)
            .collect();
        hits.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn geo_remove(&self, ctx: &RequestContext, index: &str, member: &str) -> KvResult<bool> {
        let mut data = self.lock(ctx)?;
        Ok(data
            .geo
            .get_mut(index)
            .is_some_and(|members| members.remove(member).is_some()))
    }

    async fn zadd(&self, ctx: &RequestContext, key: &str, member: &str, score: f64) -> KvResult<()> {
        let mut data = self.lock(ctx)?;
        data.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_below(
        &self,
        ctx: &RequestContext,
        key: &str,
        max: f64,
        limit: usize,
    ) -> KvResult<Vec<String>> {
        let data = self.lock(ctx)?;
        let Some(set) = data.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut below: Vec<(&String, f64)> = set
            .iter()
            .filter(|(_, score)| **score <= max)
            .map(|(m, s)| (m, *s))
            .collect();
        below.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(below.into_iter().take(limit).map(|(m, _)| m.clone()).collect())
    }

    async fn zrem(&self, ctx: &RequestContext, key: &str, members: &[String]) -> KvResult<u64> {
        let mut data = self.lock(ctx)?;
        let Some(set) = data.zsets.get_mut(key) else {
            return Ok(0);
        };
        Ok(members.iter().filter(|m| set.remove(*m).is_some()).count() as u64)
    }

    async fn list_push_trim(
        &self,
        ctx: &RequestContext,
        key: &str,
        values: &[Vec<u8>],
        cap: usize,
        ttl: Duration,
    ) -> KvResult<()> {
        let mut data = self.lock(ctx)?;
        self.check_poison(&[key])?;
        let entry = data.lists.entry(key.to_string()).or_insert(Expiring {
            value: VecDeque::new(),
            expires_at: None,
        });
        for value in values {
            entry.value.push_front(value.clone());
        }
        entry.value.truncate(cap);
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn list_range(&self, ctx: &RequestContext, key: &str, limit: usize) -> KvResult<Vec<Vec<u8>>> {
        let data = self.lock(ctx)?;
        Ok(data
            .lists
            .get(key)
            .map(|e| e.value.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn scan_page(
        &self,
        ctx: &RequestContext,
        pattern: &str,
        cursor: u64,
        page_size: usize,
    ) -> KvResult<(u64, Vec<String>)> {
        let data = self.lock(ctx)?;
        let keys = data.live_keys();
        let start = cursor as usize;
        let end = (start + page_size.max(1)).min(keys.len());
        let page = keys
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .filter(|k| glob_match(pattern.as_bytes(), k.as_bytes()))
            .cloned()
            .collect();
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn ping(&self, ctx: &RequestContext) -> KvResult<()> {
        self.lock(ctx).map(|_| ())
    }
}

/// Redis-style glob: `*` any run, `?` any single byte, everything else literal.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((bp, bt)) => {
                    p = bp + 1;
                    t = bt + 1;
                    backtrack = Some((bp, bt + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}
