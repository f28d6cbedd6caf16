//! ETA estimators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Timelike;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use ridegrid_core::{GeoPoint, RequestContext, SpeedProfile, haversine_distance, heuristic_eta};
use ridegrid_resilience::{BreakerError, CircuitBreaker, Failure, HttpError, JsonHttpClient};

/// Breaker name for the external model.
pub const ML_ETA_BREAKER: &str = "ml_eta";

/// Travel-time model for one origin/destination pair. Implementations do
/// not fail: a model that cannot answer falls back to something that can.
#[async_trait]
pub trait EtaEstimator: Send + Sync {
    async fn estimate(&self, ctx: &RequestContext, origin: &GeoPoint, destination: &GeoPoint) -> Duration;

    fn name(&self) -> &'static str;
}

/// Great-circle distance over the calibrated speed for the origin's hour,
/// or the origin's reported speed when it is usable.
#[derive(Debug, Clone, Default)]
pub struct HeuristicEstimator {
    profile: SpeedProfile,
}

impl HeuristicEstimator {
    pub fn new(profile: SpeedProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &SpeedProfile {
        &self.profile
    }

    pub fn eta(&self, origin: &GeoPoint, destination: &GeoPoint) -> Duration {
        heuristic_eta(origin, destination, &self.profile)
    }
}

#[async_trait]
impl EtaEstimator for HeuristicEstimator {
    async fn estimate(&self, _ctx: &RequestContext, origin: &GeoPoint, destination: &GeoPoint) -> Duration {
        self.eta(origin, destination)
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    origin: &'a GeoPoint,
    destination: &'a GeoPoint,
    features: Features,
}

#[derive(Debug, Serialize)]
struct Features {
    distance_m: f64,
    hour_of_day: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    observed_speed_mps: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    eta_seconds: f64,
}

#[derive(Debug, Error)]
enum ModelError {
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Negative, NaN, or too large for a `Duration`.
    #[error("unusable eta_seconds {0}")]
    Unusable(f64),
}

impl Failure for ModelError {
    fn is_cancellation(&self) -> bool {
        matches!(self, ModelError::Http(e) if e.is_cancellation())
    }
}

/// External model reached over JSON HTTP, guarded by the `ml_eta` breaker.
/// Every failure path answers with the heuristic.
pub struct HttpEtaEstimator {
    client: JsonHttpClient,
    url: String,
    breaker: Arc<CircuitBreaker>,
    fallback: HeuristicEstimator,
}

impl HttpEtaEstimator {
    pub fn new(
        client: JsonHttpClient,
        url: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
        fallback: HeuristicEstimator,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            breaker,
            fallback,
        }
    }
}

#[async_trait]
impl EtaEstimator for HttpEtaEstimator {
    async fn estimate(&self, ctx: &RequestContext, origin: &GeoPoint, destination: &GeoPoint) -> Duration {
        let request = PredictRequest {
            origin,
            destination,
            features: Features {
                distance_m: haversine_distance(origin, destination),
                hour_of_day: origin.recorded_at.hour(),
                observed_speed_mps: origin.speed,
            },
        };
        let client = &self.client;
        let url = self.url.as_str();
        let request = &request;
        let result = self
            .breaker
            .call(move || async move {
                let resp: PredictResponse = client.post_json(ctx, url, request).await?;
                Duration::try_from_secs_f64(resp.eta_seconds).map_err(|_| ModelError::Unusable(resp.eta_seconds))
            })
            .await;

        match result {
            Ok(eta) => eta,
            Err(BreakerError::Open { .. }) => {
                debug!(dependency = ML_ETA_BREAKER, "breaker open, using heuristic eta");
                self.fallback.eta(origin, destination)
            }
            Err(BreakerError::Inner(e)) => {
                warn!(dependency = ML_ETA_BREAKER, error = %e, "estimator call failed, using heuristic eta");
                self.fallback.eta(origin, destination)
            }
        }
    }

    fn name(&self) -> &'static str {
        "ml"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ridegrid_resilience::BreakerSettings;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn moving(lat: f64, lon: f64) -> GeoPoint {
        GeoPoint::now(lat, lon).with_speed(10.0)
    }

    /// Answer a single request with `body`, returning what the client sent.
    async fn model_server(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            while !String::from_utf8_lossy(&raw).contains("}}") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            String::from_utf8_lossy(&raw).to_string()
        });
        (format!("http://{addr}/predict"), handle)
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(ML_ETA_BREAKER, BreakerSettings::default()))
    }

    #[tokio::test]
    async fn heuristic_matches_pure_function() {
        let est = HeuristicEstimator::default();
        let a = moving(0.0, 0.0);
        let b = GeoPoint::now(0.0, 0.01);
        let got = est.estimate(&RequestContext::new("t"), &a, &b).await;
        assert_eq!(got, heuristic_eta(&a, &b, est.profile()));
        assert!((got.as_secs_f64() - 111.2).abs() < 1.0);
    }

    #[tokio::test]
    async fn model_answer_is_used() {
        let (url, server) = model_server(r#"{"eta_seconds":42.5}"#).await;
        let est = HttpEtaEstimator::new(
            JsonHttpClient::new("ridegrid-test", Duration::from_secs(2)),
            url,
            breaker(),
            HeuristicEstimator::default(),
        );
        let got = est
            .estimate(&RequestContext::new("req-ml"), &moving(0.0, 0.0), &GeoPoint::now(0.0, 0.01))
            .await;
        assert_eq!(got, Duration::from_millis(42_500));

        let raw = server.await.unwrap();
        assert!(raw.contains(r#""distance_m":"#));
        assert!(raw.contains(r#""observed_speed_mps":10.0"#));
    }

    #[tokio::test]
    async fn unreachable_model_falls_back_to_heuristic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let breaker = breaker();
        let est = HttpEtaEstimator::new(
            JsonHttpClient::new("ridegrid-test", Duration::from_millis(500)),
            format!("http://{addr}/predict"),
            Arc::clone(&breaker),
            HeuristicEstimator::default(),
        );
        let a = moving(0.0, 0.0);
        let b = GeoPoint::now(0.0, 0.01);
        let got = est.estimate(&RequestContext::new("t"), &a, &b).await;
        assert_eq!(got, heuristic_eta(&a, &b, &SpeedProfile::default()));
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn out_of_range_model_answer_falls_back_and_counts_failure() {
        let (url, _server) = model_server(r#"{"eta_seconds":1e30}"#).await;
        let breaker = breaker();
        let est = HttpEtaEstimator::new(
            JsonHttpClient::new("ridegrid-test", Duration::from_secs(2)),
            url,
            Arc::clone(&breaker),
            HeuristicEstimator::default(),
        );
        let a = moving(0.0, 0.0);
        let b = GeoPoint::now(0.0, 0.01);
        let got = est.estimate(&RequestContext::new("t"), &a, &b).await;
        assert_eq!(got, heuristic_eta(&a, &b, &SpeedProfile::default()));
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn negative_model_answer_falls_back() {
        let (url, _server) = model_server(r#"{"eta_seconds":-3.0}"#).await;
        let est = HttpEtaEstimator::new(
            JsonHttpClient::new("ridegrid-test", Duration::from_secs(2)),
            url,
            breaker(),
            HeuristicEstimator::default(),
        );
        let a = moving(0.0, 0.0);
        let b = GeoPoint::now(0.0, 0.01);
        let got = est.estimate(&RequestContext::new("t"), &a, &b).await;
        assert_eq!(got, heuristic_eta(&a, &b, &SpeedProfile::default()));
    }
}
