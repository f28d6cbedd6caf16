//! Minimal JSON-over-HTTP/1.1 client for outbound dependency calls
//! (maps provider, ML estimator, realtime webhook).
//!
//! One connection per call, driven in the background the same way the
//! health checker does. Every request carries the caller's `X-Request-ID`
//! and is bounded by the caller's deadline.

use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use ridegrid_core::{ErrorKind, Interrupted, RequestContext};

use crate::breaker::Failure;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid url: {0}")]
    InvalidUri(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream returned {0}: {1}")]
    Status(u16, String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}

impl HttpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HttpError::Cancelled => ErrorKind::Cancelled,
            HttpError::InvalidUri(_) => ErrorKind::Internal,
            _ => ErrorKind::Unavailable,
        }
    }

    /// Transient failures worth a second attempt on idempotent calls.
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Transport(_) | HttpError::Timeout => true,
            HttpError::Status(code, _) => *code >= 500,
            _ => false,
        }
    }
}

impl Failure for HttpError {
    fn is_cancellation(&self) -> bool {
        matches!(self, HttpError::Cancelled)
    }
}

impl From<Interrupted> for HttpError {
    fn from(i: Interrupted) -> Self {
        match i {
            Interrupted::Cancelled => HttpError::Cancelled,
            Interrupted::DeadlineExceeded => HttpError::Timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonHttpClient {
    user_agent: String,
    default_timeout: Duration,
}

impl JsonHttpClient {
    pub fn new(user_agent: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            user_agent: user_agent.into(),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn get_json<T: DeserializeOwned>(&self, ctx: &RequestContext, url: &str) -> Result<T, HttpError> {
        let body = self.send(ctx, Method::GET, url, None).await?;
        serde_json::from_slice(&body).map_err(|e| HttpError::Decode(e.to_string()))
    }

    pub async fn post_json<B, T>(&self, ctx: &RequestContext, url: &str, payload: &B) -> Result<T, HttpError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let encoded = serde_json::to_vec(payload).map_err(|e| HttpError::Decode(e.to_string()))?;
        let body = self.send(ctx, Method::POST, url, Some(encoded)).await?;
        serde_json::from_slice(&body).map_err(|e| HttpError::Decode(e.to_string()))
    }

    /// POST a JSON payload and discard the response body.
    pub async fn post_json_discard<B>(&self, ctx: &RequestContext, url: &str, payload: &B) -> Result<(), HttpError>
    where
        B: Serialize + ?Sized,
    {
        let encoded = serde_json::to_vec(payload).map_err(|e| HttpError::Decode(e.to_string()))?;
        self.send(ctx, Method::POST, url, Some(encoded)).await.map(|_| ())
    }

    async fn send(
        &self,
        ctx: &RequestContext,
        method: Method,
        url: &str,
        payload: Option<Vec<u8>>,
    ) -> Result<Bytes, HttpError> {
        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| HttpError::InvalidUri(e.to_string()))?;
        if uri.scheme_str().is_some_and(|s| s != "http") {
            return Err(HttpError::InvalidUri(format!("unsupported scheme in {url}")));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| HttpError::InvalidUri(format!("missing host in {url}")))?
            .clone();
        let address = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };
        let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(target)
            .header(HOST, authority.as_str())
            .header(USER_AGENT, self.user_agent.as_str())
            .header(REQUEST_ID_HEADER, ctx.request_id());
        if payload.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(payload.unwrap_or_default())))
            .map_err(|e| HttpError::InvalidUri(e.to_string()))?;

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&address)
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?;

            tokio::spawn(async move {
                let _ = conn.await;
            });

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?
                .to_bytes();
            Ok::<_, HttpError>((status, body))
        };

        let (status, body) = ctx.run(self.default_timeout, exchange).await??;
        if !status.is_success() {
            debug!(%status, %method, url, request_id = ctx.request_id(), "upstream non-2xx");
            return Err(HttpError::Status(status.as_u16(), snippet(&body)));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Bytes::from_static(b"null"));
        }
        Ok(body)
    }
}

fn snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.chars().take(200).collect()
}
