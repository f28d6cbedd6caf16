//! Health, introspection, and Prometheus exposition.

use std::fmt::Write as _;

use axum::Json;
use axum::extract::{Extension, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use ridegrid_cache::CacheStatsSnapshot;
use ridegrid_core::RequestContext;
use ridegrid_eta::TrackerStatsSnapshot;
use ridegrid_ingest::IngestStatsSnapshot;
use ridegrid_resilience::{BreakerSnapshot, BreakerState};

use crate::AppState;
use crate::error::ApiError;

/// GET /healthz: 200 while the KV store answers a ping.
pub async fn healthz(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Response, ApiError> {
    state.kv.ping(&ctx).await?;
    Ok(Json(json!({
        "status": "ok",
        "ingest_degraded": state.pipeline.is_degraded(),
        "active_rides": state.tracker.active_count().await,
    }))
    .into_response())
}

/// GET /internal/breakers
pub async fn breakers(State(state): State<AppState>) -> Response {
    Json(json!({ "breakers": state.breakers.snapshots() })).into_response()
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    let body = render_prometheus(&MetricsView {
        ingest: state.pipeline.stats(),
        tracker: state.tracker.stats().await,
        cache: state.geocode_cache.stats(),
        breakers: state.breakers.snapshots(),
    });
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

/// Everything `/metrics` reports, gathered up front.
pub struct MetricsView {
    pub ingest: IngestStatsSnapshot,
    pub tracker: TrackerStatsSnapshot,
    pub cache: CacheStatsSnapshot,
    pub breakers: Vec<BreakerSnapshot>,
}

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

fn breaker_state_value(state: BreakerState) -> u8 {
    match state {
        BreakerState::Closed => 0,
        BreakerState::HalfOpen => 1,
        BreakerState::Open => 2,
    }
}

/// Render the view in the Prometheus text exposition format.
pub fn render_prometheus(view: &MetricsView) -> String {
    let mut out = String::new();
    let ingest = &view.ingest;

    metric(&mut out, "ridegrid_ingest_accepted_total", "counter", "Location samples accepted.", ingest.accepted);
    let _ = writeln!(out, "# HELP ridegrid_ingest_rejected_total Location samples rejected, by reason.");
    let _ = writeln!(out, "# TYPE ridegrid_ingest_rejected_total counter");
    for (reason, count) in [
        ("invalid", ingest.rejected_invalid),
        ("stale", ingest.rejected_stale),
        ("rate", ingest.rejected_rate),
        ("buffer_full", ingest.rejected_buffer_full),
    ] {
        let _ = writeln!(out, "ridegrid_ingest_rejected_total{{reason=\"{reason}\"}} {count}");
    }
    metric(&mut out, "ridegrid_ingest_buffered_samples", "gauge", "Samples waiting for the next flush.", ingest.buffered);
    metric(&mut out, "ridegrid_ingest_flushes_total", "counter", "Flush ticks run.", ingest.flushes);
    metric(&mut out, "ridegrid_ingest_flush_failures_total", "counter", "Driver batches whose KV writes failed.", ingest.flush_failures);
    metric(&mut out, "ridegrid_ingest_degraded", "gauge", "1 while flushes are backing off.", u8::from(ingest.degraded));
    metric(&mut out, "ridegrid_ingest_persisted_total", "counter", "Samples written to durable storage.", ingest.persisted);
    metric(&mut out, "ridegrid_ingest_persist_dropped_total", "counter", "Samples dropped before durable storage.", ingest.persist_dropped);
    metric(&mut out, "ridegrid_ingest_index_pruned_total", "counter", "Expired drivers pruned from the geo index.", ingest.stale_index_pruned);

    let tracker = &view.tracker;
    metric(&mut out, "ridegrid_eta_active_rides", "gauge", "Rides with ETA recomputation running.", tracker.active_rides);
    metric(&mut out, "ridegrid_eta_publishes_total", "counter", "ETA updates published.", tracker.publishes);
    metric(&mut out, "ridegrid_eta_publish_failures_total", "counter", "ETA publishes that failed.", tracker.publish_failures);
    metric(&mut out, "ridegrid_eta_missed_ticks_total", "counter", "ETA ticks without a usable driver location or over budget.", tracker.missed_ticks);
    metric(&mut out, "ridegrid_eta_stale_rides_total", "counter", "Rides marked stale after repeated missed ticks.", tracker.stale_rides);

    let cache = &view.cache;
    metric(&mut out, "ridegrid_geocode_cache_hits_total", "counter", "Geocode cache hits.", cache.hits);
    metric(&mut out, "ridegrid_geocode_cache_misses_total", "counter", "Geocode cache misses.", cache.misses);

    out.push_str("# HELP ridegrid_breaker_state Breaker state (0 closed, 1 half-open, 2 open).\n");
    out.push_str("# TYPE ridegrid_breaker_state gauge\n");
    for b in &view.breakers {
        let _ = writeln!(out, "ridegrid_breaker_state{{name=\"{}\"}} {}", b.name, breaker_state_value(b.state));
    }
    out.push_str("# HELP ridegrid_breaker_rejected_total Calls short-circuited by an open breaker.\n");
    out.push_str("# TYPE ridegrid_breaker_rejected_total counter\n");
    for b in &view.breakers {
        let _ = writeln!(out, "ridegrid_breaker_rejected_total{{name=\"{}\"}} {}", b.name, b.rejected_total);
    }

    out
}
