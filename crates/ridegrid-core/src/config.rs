//! ridegrid.toml configuration parser.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working single-process setup with the in-memory KV store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::geo::{MIN_OBSERVED_SPEED_MPS, SpeedProfile};

/// Environment variable that overrides `geocode.maps_api_key`.
pub const ENV_MAPS_API_KEY: &str = "RIDEGRID_MAPS_API_KEY";
/// Environment variable that overrides `kv.redis_url`.
pub const ENV_REDIS_URL: &str = "RIDEGRID_REDIS_URL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RidegridConfig {
    pub server: ServerConfig,
    pub kv: KvConfig,
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub eta: EtaConfig,
    pub geocode: GeocodeConfig,
    pub idempotency: IdempotencyConfig,
    /// Breaker tuning per named dependency (`[breaker.geocode]`, `[breaker.ml_eta]`).
    pub breaker: BTreeMap<String, BreakerConfig>,
    pub ml: MlConfig,
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Global request deadline applied to every inbound request.
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    pub backend: KvBackend,
    pub redis_url: String,
    /// Prepended to every key (`{prefix}:presence:{driver}`).
    pub key_prefix: String,
    pub op_timeout_ms: u64,
    pub scan_page_size: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            backend: KvBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "rg".to_string(),
            op_timeout_ms: 250,
            scan_page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// redb file for durable location samples. In-memory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub flush_interval_ms: u64,
    pub persist_interval_ms: u64,
    pub max_samples_per_driver: usize,
    pub max_samples_per_driver_per_second: u32,
    pub presence_ttl_sec: u64,
    pub history_size: usize,
    pub max_accuracy_meters: Option<f64>,
    pub global_buffer_cap: usize,
    pub degraded_after_failures: u32,
    pub max_flush_backoff_ms: u64,
    pub stop_deadline_ms: u64,
    pub persist_batch_max: usize,
    /// Upper bound on queued-but-unpersisted samples before the oldest are dropped.
    pub persist_queue_cap: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1_000,
            persist_interval_ms: 30_000,
            max_samples_per_driver: 20,
            max_samples_per_driver_per_second: 5,
            presence_ttl_sec: 60,
            history_size: 50,
            max_accuracy_meters: Some(100.0),
            global_buffer_cap: 100_000,
            degraded_after_failures: 5,
            max_flush_backoff_ms: 30_000,
            stop_deadline_ms: 5_000,
            persist_batch_max: 2_000,
            persist_queue_cap: 200_000,
        }
    }
}

impl IngestConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_sec)
    }

    pub fn max_flush_backoff(&self) -> Duration {
        Duration::from_millis(self.max_flush_backoff_ms)
    }

    pub fn stop_deadline(&self) -> Duration {
        Duration::from_millis(self.stop_deadline_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtaConfig {
    pub eta_refresh_interval_ms: u64,
    pub eta_change_threshold_sec: u64,
    pub force_publish_interval_sec: u64,
    pub missed_ticks_threshold: u32,
    pub worker_pool_size: usize,
    pub tick_budget_ms: u64,
    pub ride_tracking_max_age_sec: u64,
    pub speed_profile: SpeedProfile,
}

impl Default for EtaConfig {
    fn default() -> Self {
        Self {
            eta_refresh_interval_ms: 5_000,
            eta_change_threshold_sec: 10,
            force_publish_interval_sec: 30,
            missed_ticks_threshold: 6,
            worker_pool_size: 64,
            tick_budget_ms: 2_000,
            ride_tracking_max_age_sec: 2 * 60 * 60,
            speed_profile: SpeedProfile::default(),
        }
    }
}

impl EtaConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.eta_refresh_interval_ms)
    }

    pub fn change_threshold(&self) -> Duration {
        Duration::from_secs(self.eta_change_threshold_sec)
    }

    pub fn force_publish_interval(&self) -> Duration {
        Duration::from_secs(self.force_publish_interval_sec)
    }

    pub fn tick_budget(&self) -> Duration {
        Duration::from_millis(self.tick_budget_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.ride_tracking_max_age_sec)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodeConfig {
    /// Base URL of the map provider's geocoding endpoint.
    pub provider_url: Option<String>,
    pub provider_name: String,
    pub maps_api_key: Option<String>,
    pub maps_region_bias: Option<String>,
    pub maps_language: Option<String>,
    pub geocode_cache_ttl_sec: u64,
    pub timeout_ms: u64,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            provider_url: None,
            provider_name: "maps".to_string(),
            maps_api_key: None,
            maps_region_bias: None,
            maps_language: None,
            geocode_cache_ttl_sec: 24 * 60 * 60,
            timeout_ms: 3_000,
        }
    }
}

impl GeocodeConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.geocode_cache_ttl_sec)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub idempotency_ttl_sec: u64,
    /// How long a request that lost the executor election polls for the winner's record.
    pub wait_ms: u64,
    /// Lifetime of the in-progress marker that elects an executor.
    pub lock_ttl_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl_sec: 24 * 60 * 60,
            wait_ms: 2_000,
            lock_ttl_ms: 30_000,
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_sec)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
    pub half_open_window: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 30_000,
            half_open_window: 1,
        }
    }
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlConfig {
    /// Prediction endpoint of the optional ML ETA estimator.
    pub estimator_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            estimator_url: None,
            timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Webhook that receives ETA updates. Updates are only broadcast in-process when unset.
    pub webhook_url: Option<String>,
}

impl RidegridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: RidegridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Breaker settings for a named dependency, falling back to defaults.
    pub fn breaker_for(&self, name: &str) -> BreakerConfig {
        self.breaker.get(name).cloned().unwrap_or_default()
    }

    /// Apply secret overrides from the environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_MAPS_API_KEY).filter(|v| !v.is_empty()) {
            self.geocode.maps_api_key = Some(key);
        }
        if let Some(url) = lookup(ENV_REDIS_URL).filter(|v| !v.is_empty()) {
            self.kv.redis_url = url;
        }
    }

    /// Reject values that would stall or disable a component.
    pub fn validate(&self) -> anyhow::Result<()> {
        let ingest = &self.ingest;
        if ingest.flush_interval_ms == 0 || ingest.persist_interval_ms == 0 {
            anyhow::bail!("ingest intervals must be non-zero");
        }
        if ingest.max_samples_per_driver == 0 {
            anyhow::bail!("ingest.max_samples_per_driver must be at least 1");
        }
        if ingest.max_samples_per_driver_per_second == 0 {
            anyhow::bail!("ingest.max_samples_per_driver_per_second must be at least 1");
        }
        if ingest.presence_ttl_sec == 0 {
            anyhow::bail!("ingest.presence_ttl_sec must be non-zero");
        }
        if ingest.history_size == 0 || ingest.global_buffer_cap == 0 {
            anyhow::bail!("ingest.history_size and ingest.global_buffer_cap must be non-zero");
        }
        if self.eta.eta_refresh_interval_ms == 0 || self.eta.tick_budget_ms == 0 {
            anyhow::bail!("eta intervals must be non-zero");
        }
        if self.eta.worker_pool_size == 0 {
            anyhow::bail!("eta.worker_pool_size must be at least 1");
        }
        if self.kv.scan_page_size == 0 {
            anyhow::bail!("kv.scan_page_size must be at least 1");
        }
        let usable = |mps: f64| mps.is_finite() && mps >= MIN_OBSERVED_SPEED_MPS;
        let profile = &self.eta.speed_profile;
        if !usable(profile.fallback_mps) || !profile.bands.iter().all(|b| usable(b.speed_mps)) {
            anyhow::bail!("eta.speed_profile speeds must be finite and at least {MIN_OBSERVED_SPEED_MPS} m/s");
        }
        for (name, b) in &self.breaker {
            if b.failure_threshold == 0 || b.success_threshold == 0 || b.half_open_window == 0 {
                anyhow::bail!("breaker.{name}: thresholds and half_open_window must be at least 1");
            }
        }
        Ok(())
    }
}
