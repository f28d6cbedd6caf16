//! Map provider clients.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use ridegrid_core::config::GeocodeConfig;
use ridegrid_core::{GeoPoint, GeocodeQuery, GeocodeRequest, GeocodeResult, RequestContext};
use ridegrid_resilience::{HttpError, JsonHttpClient};

use crate::error::ProviderError;

/// A forward/reverse geocoder. `Ok(None)` means the provider answered with
/// no match, which is not a dependency failure.
#[async_trait]
pub trait MapProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn geocode(
        &self,
        ctx: &RequestContext,
        request: &GeocodeRequest,
    ) -> Result<Option<GeocodeResult>, ProviderError>;
}

// ── HTTP provider ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<ResultEntry>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultEntry {
    formatted_address: String,
    geometry: Geometry,
    #[serde(default)]
    address_components: Vec<AddressComponent>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct AddressComponent {
    long_name: String,
    #[serde(default)]
    types: Vec<String>,
}

/// Client for a Google-style JSON geocoding endpoint
/// (`{base}?address=...` / `{base}?latlng=...`).
pub struct HttpMapProvider {
    name: String,
    client: JsonHttpClient,
    base_url: String,
    api_key: Option<String>,
}

impl HttpMapProvider {
    pub fn new(client: JsonHttpClient, base_url: impl Into<String>, name: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            name: name.into(),
            client,
            base_url: base_url.into(),
            api_key,
        }
    }

    /// Build from the `[geocode]` section. Returns `None` without a provider URL.
    pub fn from_config(config: &GeocodeConfig) -> Option<Self> {
        let url = config.provider_url.as_ref()?;
        Some(Self::new(
            JsonHttpClient::new(concat!("ridegrid/", env!("CARGO_PKG_VERSION")), config.timeout()),
            url.clone(),
            config.provider_name.clone(),
            config.maps_api_key.clone(),
        ))
    }

    fn request_url(&self, request: &GeocodeRequest) -> String {
        let mut url = self.base_url.clone();
        url.push(if url.contains('?') { '&' } else { '?' });
        match &request.query {
            GeocodeQuery::Text(text) => {
                let _ = write!(url, "address={}", encode_component(text));
            }
            GeocodeQuery::Point { lat, lon } => {
                let _ = write!(url, "latlng={lat},{lon}");
            }
        }
        if let Some(region) = &request.region {
            let _ = write!(url, "&region={}", encode_component(region));
        }
        if let Some(language) = &request.language {
            let _ = write!(url, "&language={}", encode_component(language));
        }
        if let Some(key) = &self.api_key {
            let _ = write!(url, "&key={}", encode_component(key));
        }
        url
    }
}

#[async_trait]
impl MapProvider for HttpMapProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn geocode(
        &self,
        ctx: &RequestContext,
        request: &GeocodeRequest,
    ) -> Result<Option<GeocodeResult>, ProviderError> {
        let response: GeocodeResponse = self.client.get_json(ctx, &self.request_url(request)).await?;
        match response.status.as_str() {
            "OK" => {}
            "ZERO_RESULTS" => return Ok(None),
            other => {
                let detail = response.error_message.unwrap_or_default();
                return Err(ProviderError::Rejected(format!("{other} {detail}").trim().to_string()));
            }
        }
        let Some(first) = response.results.into_iter().next() else {
            return Ok(None);
        };
        let components: BTreeMap<String, String> = first
            .address_components
            .into_iter()
            .filter_map(|c| c.types.into_iter().next().map(|t| (t, c.long_name)))
            .collect();
        debug!(provider = %self.name, kind = request.kind.as_str(), "provider answered");
        Ok(Some(GeocodeResult {
            formatted_address: first.formatted_address,
            point: GeoPoint::now(first.geometry.location.lat, first.geometry.location.lng),
            components,
            provider: self.name.clone(),
            cached: false,
        }))
    }
}

/// Percent-encode a query-string component (RFC 3986 unreserved set kept).
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

// ── Stand-ins ──────────────────────────────────────────────────────

/// Used when no provider URL is configured: every call fails, so reverse
/// lookups degrade and forward lookups report `Unavailable`.
pub struct DisabledProvider;

#[async_trait]
impl MapProvider for DisabledProvider {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn geocode(
        &self,
        _ctx: &RequestContext,
        _request: &GeocodeRequest,
    ) -> Result<Option<GeocodeResult>, ProviderError> {
        Err(ProviderError::Unconfigured)
    }
}

type Responder = dyn Fn(&GeocodeRequest) -> Option<GeocodeResult> + Send + Sync;

/// In-process provider answering from a closure. Can be switched into a
/// failing mode; counts every call it receives.
pub struct ScriptedProvider {
    name: String,
    responder: Box<Responder>,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl ScriptedProvider {
    pub fn new<F>(name: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&GeocodeRequest) -> Option<GeocodeResult> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            responder: Box::new(responder),
            failing: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    /// Answers every request with a fixed address at the queried position
    /// (reverse) or at `(0, 0)` (forward).
    pub fn echo(name: impl Into<String>) -> Self {
        let name = name.into();
        let provider = name.clone();
        Self::new(name, move |request| {
            let (address, lat, lon) = match &request.query {
                GeocodeQuery::Text(text) => (text.clone(), 0.0, 0.0),
                GeocodeQuery::Point { lat, lon } => (format!("near {lat},{lon}"), *lat, *lon),
            };
            Some(GeocodeResult {
                formatted_address: address,
                point: GeoPoint::now(lat, lon),
                components: BTreeMap::new(),
                provider: provider.clone(),
                cached: false,
            })
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MapProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn geocode(
        &self,
        _ctx: &RequestContext,
        request: &GeocodeRequest,
    ) -> Result<Option<GeocodeResult>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Http(HttpError::Status(500, "scripted failure".to_string())));
        }
        Ok((self.responder)(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn provider_server(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            while !String::from_utf8_lossy(&raw).contains("\r\n\r\n") {
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
        (format!("http://{addr}/maps/api/geocode/json"), handle)
    }

    fn provider(url: String) -> HttpMapProvider {
        HttpMapProvider::new(
            JsonHttpClient::new("ridegrid-test", Duration::from_secs(2)),
            url,
            "maps",
            Some("secret key".to_string()),
        )
    }

    #[tokio::test]
    async fn forward_lookup_parses_first_result() {
        let (url, server) = provider_server(
            r#"{"status":"OK","results":[{"formatted_address":"1 Market St, San Francisco","geometry":{"location":{"lat":37.79,"lng":-122.39}},"address_components":[{"long_name":"San Francisco","short_name":"SF","types":["locality","political"]}]}]}"#,
        )
        .await;
        let request = GeocodeRequest::forward("1 Market St", Some("us".to_string()), None);
        let result = provider(url)
            .geocode(&RequestContext::new("t"), &request)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.formatted_address, "1 Market St, San Francisco");
        assert_eq!(result.point.latitude, 37.79);
        assert_eq!(result.components.get("locality").map(String::as_str), Some("San Francisco"));
        assert_eq!(result.provider, "maps");

        let raw = server.await.unwrap();
        let request_line = raw.lines().next().unwrap();
        assert!(request_line.contains("address=1%20Market%20St"));
        assert!(request_line.contains("&region=us"));
        assert!(request_line.contains("&key=secret%20key"));
    }

    #[tokio::test]
    async fn zero_results_is_not_a_failure() {
        let (url, _server) = provider_server(r#"{"status":"ZERO_RESULTS","results":[]}"#).await;
        let request = GeocodeRequest::reverse(0.0, -160.0, None);
        let result = provider(url).geocode(&RequestContext::new("t"), &request).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn refused_request_is_an_error() {
        let (url, _server) =
            provider_server(r#"{"status":"OVER_QUERY_LIMIT","error_message":"quota"}"#).await;
        let request = GeocodeRequest::forward("x", None, None);
        let err = provider(url).geocode(&RequestContext::new("t"), &request).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(msg) if msg == "OVER_QUERY_LIMIT quota"));
    }

    #[test]
    fn component_encoding() {
        assert_eq!(encode_component("a b&c=d/é"), "a%20b%26c%3Dd%2F%C3%A9");
        assert_eq!(encode_component("Safe-_.~9"), "Safe-_.~9");
    }

    #[tokio::test]
    async fn scripted_provider_counts_and_fails_on_demand() {
        let provider = ScriptedProvider::echo("scripted");
        let ctx = RequestContext::new("t");
        let request = GeocodeRequest::forward("somewhere", None, None);
        assert!(provider.geocode(&ctx, &request).await.unwrap().is_some());
        provider.set_failing(true);
        assert!(provider.geocode(&ctx, &request).await.is_err());
        assert_eq!(provider.calls(), 2);
    }
}
