//! Subsystem assembly and the serve loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use ridegrid_api::{ApiSettings, AppState};
use ridegrid_cache::{CacheManager, IdempotencySettings, IdempotencyStore};
use ridegrid_core::RidegridConfig;
use ridegrid_core::config::KvBackend;
use ridegrid_eta::{EtaTracker, LogPublisher, Publisher, REALTIME_BREAKER, WebhookPublisher};
use ridegrid_geo::{EtaEstimator, GeoQueryService, HeuristicEstimator, HttpEtaEstimator, ML_ETA_BREAKER};
use ridegrid_geocode::{DisabledProvider, GeocodingGateway, HttpMapProvider, MapProvider, breaker_name};
use ridegrid_ingest::LocationPipeline;
use ridegrid_resilience::{BreakerRegistry, BreakerSettings, JsonHttpClient};
use ridegrid_state::{KeySpace, KvStore, MemoryKv, RedisKv, SampleSink, SampleStore};

const USER_AGENT: &str = concat!("ridegrid/", env!("CARGO_PKG_VERSION"));

fn open_kv(config: &RidegridConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    let kv: Arc<dyn KvStore> = match config.kv.backend {
        KvBackend::Memory => {
            warn!("using in-memory kv store; state is lost on restart");
            Arc::new(MemoryKv::new())
        }
        KvBackend::Redis => Arc::new(RedisKv::new(
            &config.kv.redis_url,
            Duration::from_millis(config.kv.op_timeout_ms),
        )?),
    };
    Ok(kv)
}

fn open_sample_store(config: &RidegridConfig) -> anyhow::Result<Arc<dyn SampleSink>> {
    let store = match &config.storage.path {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let store = SampleStore::open(path)?;
            info!(path = %path.display(), "sample store opened");
            store
        }
        None => {
            warn!("no storage.path configured; samples are kept in memory only");
            SampleStore::open_in_memory()?
        }
    };
    Ok(Arc::new(store))
}

fn breaker_settings(config: &RidegridConfig, name: &str) -> BreakerSettings {
    BreakerSettings::from(&config.breaker_for(name))
}

fn build_estimator(config: &RidegridConfig, breakers: &BreakerRegistry) -> Arc<dyn EtaEstimator> {
    let heuristic = HeuristicEstimator::new(config.eta.speed_profile.clone());
    match &config.ml.estimator_url {
        Some(url) => {
            let breaker = breakers.get_or_insert(ML_ETA_BREAKER, breaker_settings(config, ML_ETA_BREAKER));
            let client = JsonHttpClient::new(USER_AGENT, Duration::from_millis(config.ml.timeout_ms));
            info!(%url, "using external eta estimator");
            Arc::new(HttpEtaEstimator::new(client, url.clone(), breaker, heuristic))
        }
        None => Arc::new(heuristic),
    }
}

fn build_map_provider(config: &RidegridConfig) -> Arc<dyn MapProvider> {
    match HttpMapProvider::from_config(&config.geocode) {
        Some(provider) => Arc::new(provider),
        None => {
            warn!("no geocode.provider_url configured; geocoding is unavailable");
            Arc::new(DisabledProvider)
        }
    }
}

fn build_publisher(config: &RidegridConfig, breakers: &BreakerRegistry) -> Arc<dyn Publisher> {
    match &config.realtime.webhook_url {
        Some(url) => {
            let breaker = breakers.get_or_insert(REALTIME_BREAKER, breaker_settings(config, REALTIME_BREAKER));
            let client = JsonHttpClient::new(USER_AGENT, config.eta.tick_budget());
            info!(%url, "publishing eta updates to webhook");
            Arc::new(WebhookPublisher::new(client, url.clone(), breaker))
        }
        None => {
            warn!("no realtime.webhook_url configured; eta updates are only logged");
            Arc::new(LogPublisher)
        }
    }
}

/// Open stores and wire every component. Nothing is started.
pub fn assemble(config: &RidegridConfig) -> anyhow::Result<AppState> {
    let kv = open_kv(config)?;
    let keys = KeySpace::new(config.kv.key_prefix.clone());
    let sink = open_sample_store(config)?;
    let breakers = Arc::new(BreakerRegistry::new());

    let pipeline = Arc::new(LocationPipeline::new(
        config.ingest.clone(),
        kv.clone(),
        keys.clone(),
        sink,
    ));

    let geo = GeoQueryService::new(kv.clone(), keys.clone(), build_estimator(config, &breakers));

    let geocode_cache = CacheManager::new(kv.clone(), config.kv.scan_page_size);
    let provider = build_map_provider(config);
    let geocode_breaker = breaker_name(provider.name());
    let geocoder = Arc::new(GeocodingGateway::new(
        geocode_cache.clone(),
        keys.clone(),
        provider,
        &breakers,
        breaker_settings(config, &geocode_breaker),
        &config.geocode,
    ));

    let tracker = Arc::new(EtaTracker::new(
        config.eta.clone(),
        geo.clone(),
        build_publisher(config, &breakers),
    ));

    let idempotency = IdempotencyStore::new(kv.clone(), keys, IdempotencySettings::from(&config.idempotency));

    Ok(AppState {
        kv,
        pipeline,
        geo,
        geocoder,
        geocode_cache,
        tracker,
        idempotency,
        breakers,
        settings: ApiSettings::from_config(config),
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install ctrl-c handler; serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Start background workers, serve until ctrl-c, then drain.
pub async fn run(config: RidegridConfig) -> anyhow::Result<()> {
    info!("ridegrid daemon starting");

    let state = assemble(&config)?;

    state.pipeline.start();
    state.tracker.start();
    info!(
        flush_ms = config.ingest.flush_interval_ms,
        eta_refresh_ms = config.eta.eta_refresh_interval_ms,
        estimator = state.geo.estimator_name(),
        publisher = state.tracker.publisher_name(),
        "background workers started"
    );

    let router = ridegrid_api::build_router(state.clone());
    let addr: SocketAddr = config.server.listen.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.tracker.stop_all().await;
    let report = state.pipeline.stop().await;
    info!(?report, "final flush done");

    info!("ridegrid daemon stopped");
    Ok(())
}
