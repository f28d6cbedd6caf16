//! Real-time channel publishers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use ridegrid_core::{EtaUpdate, RequestContext};
use ridegrid_resilience::{BreakerError, CircuitBreaker, JsonHttpClient};

use crate::error::PublishError;

/// Breaker name for the webhook publisher.
pub const REALTIME_BREAKER: &str = "realtime";

/// Pushes ETA updates to riders. Best-effort: an implementation may return
/// before the update is delivered.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &RequestContext, update: &EtaUpdate) -> Result<(), PublishError>;

    fn name(&self) -> &'static str;
}

/// In-process fan-out over a tokio broadcast channel. Slow subscribers lag
/// and lose the oldest updates; nobody listening is not an error.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: broadcast::Sender<EtaUpdate>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EtaUpdate> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, _ctx: &RequestContext, update: &EtaUpdate) -> Result<(), PublishError> {
        if self.tx.send(update.clone()).is_err() {
            debug!(ride_id = %update.ride_id, "no eta subscribers");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// POSTs each update as JSON to a webhook.
pub struct WebhookPublisher {
    client: JsonHttpClient,
    url: String,
    breaker: Arc<CircuitBreaker>,
}

impl WebhookPublisher {
    pub fn new(client: JsonHttpClient, url: impl Into<String>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            client,
            url: url.into(),
            breaker,
        }
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, ctx: &RequestContext, update: &EtaUpdate) -> Result<(), PublishError> {
        let client = &self.client;
        let url = self.url.as_str();
        self.breaker
            .call(move || client.post_json_discard(ctx, url, update))
            .await
            .map_err(|e| match e {
                BreakerError::Open { name } => PublishError::BreakerOpen(name),
                BreakerError::Inner(e) => PublishError::Http(e),
            })
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Writes updates to the log and nowhere else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, ctx: &RequestContext, update: &EtaUpdate) -> Result<(), PublishError> {
        info!(
            request_id = ctx.request_id(),
            ride_id = %update.ride_id,
            eta_secs = update.eta_secs,
            "eta update"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ridegrid_core::{GeoPoint, RideId};
    use ridegrid_resilience::BreakerSettings;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn update() -> EtaUpdate {
        EtaUpdate {
            ride_id: RideId::new(),
            driver_point: GeoPoint::now(0.0, 0.0),
            destination: GeoPoint::now(0.0, 0.01),
            eta_secs: 111.3,
            computed_at: Utc::now(),
        }
    }

    /// Reads one request (headers plus content-length body) and answers `status`.
    async fn webhook_server(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if raw.len() >= split + 4 + length {
                        break;
                    }
                }
            }
            let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            let _ = socket.write_all(response.as_bytes()).await;
            String::from_utf8_lossy(&raw).to_string()
        });
        (format!("http://{addr}/eta"), handle)
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(REALTIME_BREAKER, BreakerSettings::default()))
    }

    #[tokio::test]
    async fn channel_fans_out_to_subscribers() {
        let publisher = ChannelPublisher::new(8);
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();
        let sent = update();
        publisher.publish(&RequestContext::new("t"), &sent).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), sent);
        assert_eq!(b.recv().await.unwrap(), sent);
    }

    #[tokio::test]
    async fn channel_without_subscribers_is_fine() {
        let publisher = ChannelPublisher::new(8);
        assert_eq!(publisher.subscriber_count(), 0);
        assert!(publisher.publish(&RequestContext::new("t"), &update()).await.is_ok());
    }

    #[tokio::test]
    async fn webhook_posts_update_json() {
        let (url, server) = webhook_server("204 No Content").await;
        let publisher = WebhookPublisher::new(
            JsonHttpClient::new("ridegrid-test", Duration::from_secs(2)),
            url,
            breaker(),
        );
        let sent = update();
        publisher.publish(&RequestContext::new("req-hook"), &sent).await.unwrap();

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /eta"));
        assert!(raw.to_ascii_lowercase().contains("x-request-id: req-hook"));
        assert!(raw.contains(&sent.ride_id.to_string()));
        assert!(raw.contains(r#""eta_secs":111.3"#));
    }

    #[tokio::test]
    async fn webhook_error_status_is_reported() {
        let (url, _server) = webhook_server("500 Internal Server Error").await;
        let breaker = breaker();
        let publisher = WebhookPublisher::new(
            JsonHttpClient::new("ridegrid-test", Duration::from_secs(2)),
            url,
            Arc::clone(&breaker),
        );
        let err = publisher.publish(&RequestContext::new("t"), &update()).await.unwrap_err();
        assert!(matches!(err, PublishError::Http(_)));
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }
}
