//! GeocodingGateway — cache, breaker, and degradation around a MapProvider.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use ridegrid_cache::{CacheManager, CacheResult};
use ridegrid_core::config::GeocodeConfig;
use ridegrid_core::{GeoPoint, GeocodeRequest, GeocodeResult, RequestContext, normalize_query};
use ridegrid_resilience::{BreakerError, BreakerRegistry, BreakerSettings, CircuitBreaker, Failure};
use ridegrid_state::KeySpace;

use crate::error::{GeocodeError, ProviderError};
use crate::provider::MapProvider;

const MAX_QUERY_LEN: usize = 512;

/// Breaker name for a provider, also the `[breaker.<name>]` config table.
pub fn breaker_name(provider: &str) -> String {
    format!("geocode_{provider}")
}

pub struct GeocodingGateway {
    cache: CacheManager,
    keys: KeySpace,
    provider: Arc<dyn MapProvider>,
    breaker: Arc<CircuitBreaker>,
    cache_ttl: Duration,
    timeout: Duration,
    region_bias: Option<String>,
    language: Option<String>,
}

impl GeocodingGateway {
    pub fn new(
        cache: CacheManager,
        keys: KeySpace,
        provider: Arc<dyn MapProvider>,
        breakers: &BreakerRegistry,
        breaker_settings: BreakerSettings,
        config: &GeocodeConfig,
    ) -> Self {
        let breaker = breakers.get_or_insert(&breaker_name(provider.name()), breaker_settings);
        Self {
            cache,
            keys,
            provider,
            breaker,
            cache_ttl: config.cache_ttl(),
            timeout: config.timeout(),
            region_bias: config.maps_region_bias.clone(),
            language: config.maps_language.clone(),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Address text to position. Fails with `Unavailable` when the provider
    /// cannot be reached; there is no synthesized answer for this direction.
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        query: &str,
        region: Option<String>,
        language: Option<String>,
    ) -> Result<GeocodeResult, GeocodeError> {
        if normalize_query(query).is_empty() {
            return Err(GeocodeError::InvalidInput("query must not be empty".to_string()));
        }
        if query.len() > MAX_QUERY_LEN {
            return Err(GeocodeError::InvalidInput(format!(
                "query longer than {MAX_QUERY_LEN} bytes"
            )));
        }
        let request = GeocodeRequest::forward(
            query,
            region.or_else(|| self.region_bias.clone()),
            language.or_else(|| self.language.clone()),
        );
        self.resolve(ctx, request).await
    }

    /// Position to address. Degrades to `"lat,lon"` with provider
    /// `"degraded"` when the provider is unavailable; that answer is never
    /// cached.
    pub async fn reverse(
        &self,
        ctx: &RequestContext,
        lat: f64,
        lon: f64,
        language: Option<String>,
    ) -> Result<GeocodeResult, GeocodeError> {
        GeoPoint::now(lat, lon)
            .validate(None)
            .map_err(|e| GeocodeError::InvalidInput(e.to_string()))?;
        let request = GeocodeRequest::reverse(lat, lon, language.or_else(|| self.language.clone()));
        match self.resolve(ctx, request).await {
            Err(e @ (GeocodeError::BreakerOpen { .. } | GeocodeError::Provider { .. })) => {
                info!(error = %e, lat, lon, "serving degraded reverse geocode");
                Ok(GeocodeResult::degraded_reverse(lat, lon))
            }
            other => other,
        }
    }

    /// Drop every cached geocoding answer. Maintenance only.
    pub async fn invalidate_cache(&self, ctx: &RequestContext) -> CacheResult<u64> {
        self.cache.invalidate(ctx, &self.keys.geocode_pattern()).await
    }

    /// Cache key: SHA-256 of the normalized fingerprint input.
    pub fn cache_key(&self, request: &GeocodeRequest) -> String {
        let digest = Sha256::digest(request.fingerprint_input().as_bytes());
        self.keys.geocode(&hex::encode(digest))
    }

    async fn resolve(&self, ctx: &RequestContext, request: GeocodeRequest) -> Result<GeocodeResult, GeocodeError> {
        let key = self.cache_key(&request);
        let pending = &request;
        let cached = self
            .cache
            .get_or_set(ctx, &key, self.cache_ttl, move || self.fetch(ctx, pending))
            .await?;
        let mut result = cached.value;
        result.cached = cached.hit;
        debug!(kind = request.kind.as_str(), hit = cached.hit, "geocode resolved");
        Ok(result)
    }

    async fn fetch(&self, ctx: &RequestContext, request: &GeocodeRequest) -> Result<GeocodeResult, GeocodeError> {
        let call_ctx = &ctx.child_with_timeout(self.timeout);
        let provider = self.provider.as_ref();
        let timeout = self.timeout;
        let outcome = self
            .breaker
            .call(move || async move {
                call_ctx
                    .run(timeout, provider.geocode(call_ctx, request))
                    .await
                    .map_err(ProviderError::from)
                    .and_then(|answer| answer)
            })
            .await;

        let dependency = self.breaker.name();
        match outcome {
            Ok(Some(mut result)) => {
                result.cached = false;
                Ok(result)
            }
            Ok(None) => Err(GeocodeError::NotFound),
            Err(BreakerError::Open { name }) => {
                debug!(dependency = %name, "geocode short-circuited");
                Err(GeocodeError::BreakerOpen { dependency: name })
            }
            Err(BreakerError::Inner(e)) if e.is_cancellation() => Err(GeocodeError::Cancelled),
            Err(BreakerError::Inner(source)) => {
                warn!(dependency, error = %source, "geocoding provider call failed");
                Err(GeocodeError::Provider {
                    dependency: dependency.to_string(),
                    source,
                })
            }
        }
    }
}
