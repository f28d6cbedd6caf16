//! Request middleware: correlation context and the idempotency gate.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes, to_bytes};
use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::FutureExt;
use tracing::{Instrument, debug, error, info_span, warn};

use ridegrid_cache::{Begin, IdempotencyRecord, fingerprint, scope_hash};
use ridegrid_core::RequestContext;

use crate::AppState;
use crate::error::ApiError;

pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");
pub const IDEMPOTENT_REPLAYED: HeaderName = HeaderName::from_static("idempotent-replayed");
/// Authenticated caller, set by the gateway in front of this service.
pub const CALLER_ID: HeaderName = HeaderName::from_static("x-caller-id");

const MAX_REQUEST_ID_LEN: usize = 128;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
/// Largest request body the idempotency gate will buffer.
const MAX_BODY_BYTES: usize = 256 * 1024;
/// Response headers stored with an idempotency record and replayed.
const REPLAYED_HEADERS: [HeaderName; 2] = [header::CONTENT_TYPE, header::LOCATION];

fn header_text(headers: &HeaderMap, name: &HeaderName, max_len: usize) -> Option<String> {
    let raw = headers.get(name)?.to_str().ok()?.trim();
    if raw.is_empty() || raw.len() > max_len {
        return None;
    }
    Some(raw.to_string())
}

fn new_request_id() -> String {
    format!("req-{:016x}", rand::random::<u64>())
}

fn route_of(req: &Request) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string())
}

/// Outermost layer. Builds the [`RequestContext`] (request id, deadline,
/// cancellation), runs the rest of the stack inside an `http.request`
/// span, turns a handler panic into a 500, and echoes `X-Request-ID`.
///
/// Dropping the request (client gone) cancels the context, and with it
/// every outbound call the handler still has in flight.
pub async fn request_context(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let request_id = header_text(req.headers(), &REQUEST_ID, MAX_REQUEST_ID_LEN).unwrap_or_else(new_request_id);
    let method = req.method().clone();
    let route = route_of(&req);
    let timeout = state.settings.request_timeout;

    let ctx = RequestContext::new(request_id.clone())
        .with_deadline(tokio::time::Instant::now() + timeout);
    let _cancel_on_drop = ctx.cancel_token().clone().drop_guard();
    req.extensions_mut().insert(ctx);

    let span = info_span!("http.request", request_id = %request_id, method = %method, route = %route);
    let started = Instant::now();
    let outcome = async {
        tokio::time::timeout(timeout, AssertUnwindSafe(next.run(req)).catch_unwind()).await
    }
    .instrument(span.clone())
    .await;

    let mut response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(_)) => {
            span.in_scope(|| error!("handler panicked"));
            ApiError::internal("internal error").into_response()
        }
        Err(_) => span.in_scope(|| {
            ApiError::unavailable("request", format!("request exceeded {}ms deadline", timeout.as_millis()))
                .into_response()
        }),
    };
    span.in_scope(|| {
        debug!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        )
    });
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    response
}

/// Caller identity for idempotency scoping: the authenticated caller when
/// the gateway supplies one, otherwise the client address.
fn caller_identity(req: &Request) -> String {
    if let Some(caller) = header_text(req.headers(), &CALLER_ID, 256) {
        return format!("caller:{caller}");
    }
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return format!("ip:{ip}");
    }
    match req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
        None => "anonymous".to_string(),
    }
}

fn replay(record: IdempotencyRecord) -> Response {
    let status = StatusCode::from_u16(record.status).unwrap_or(StatusCode::OK);
    let mut response = (status, Body::from(record.body)).into_response();
    let headers = response.headers_mut();
    for (name, value) in &record.headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
    headers.insert(IDEMPOTENT_REPLAYED, HeaderValue::from_static("true"));
    response
}

/// Deduplicates mutating requests carrying `Idempotency-Key`. A 2xx
/// response is recorded for replay; a reused key with a different payload
/// is a conflict. KV trouble fails open: the request runs unprotected.
pub async fn idempotency_gate(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH) {
        return next.run(req).await;
    }
    let Some(raw_key) = req.headers().get(&IDEMPOTENCY_KEY) else {
        return next.run(req).await;
    };
    let key = match raw_key.to_str().map(str::trim) {
        Ok(key) if !key.is_empty() && key.len() <= MAX_IDEMPOTENCY_KEY_LEN => key.to_string(),
        _ => return ApiError::invalid("Idempotency-Key must be 1-255 visible characters").into_response(),
    };
    let Some(ctx) = req.extensions().get::<RequestContext>().cloned() else {
        return next.run(req).await;
    };

    let route = route_of(&req);
    let caller = caller_identity(&req);
    let (parts, body) = req.into_parts();
    let body: Bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => return ApiError::invalid(format!("unreadable request body: {e}")).into_response(),
    };
    let fp = fingerprint(parts.method.as_str(), &route, &body);
    let scope = scope_hash(&caller, &key);
    let req = Request::from_parts(parts, Body::from(body));

    match state.idempotency.begin(&ctx, &scope, &fp).await {
        Ok(Begin::Replay(record)) => replay(record),
        Ok(Begin::Mismatch) => ApiError::conflict("idempotency key reused with a different payload").into_response(),
        Ok(Begin::InProgress) => {
            ApiError::conflict("a request with this idempotency key is still in progress").into_response()
        }
        Ok(Begin::Execute) => execute_and_record(&state, &ctx, &scope, fp, req, next).await,
        Err(e) => {
            warn!(dependency = "kv", error = %e, "idempotency store unavailable, passing request through");
            next.run(req).await
        }
    }
}

async fn execute_and_record(
    state: &AppState,
    ctx: &RequestContext,
    scope: &str,
    fp: String,
    req: Request,
    next: Next,
) -> Response {
    let response = next.run(req).await;
    if !response.status().is_success() {
        state.idempotency.abandon(ctx, scope).await;
        return response;
    }

    let (parts, body) = response.into_parts();
    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            state.idempotency.abandon(ctx, scope).await;
            return ApiError::internal(format!("response body unreadable: {e}")).into_response();
        }
    };
    let record = IdempotencyRecord {
        fingerprint: fp,
        status: parts.status.as_u16(),
        headers: REPLAYED_HEADERS
            .iter()
            .filter_map(|name| {
                let value = parts.headers.get(name)?.to_str().ok()?;
                Some((name.as_str().to_string(), value.to_string()))
            })
            .collect(),
        body: body.to_vec(),
        stored_at: Utc::now(),
    };
    if let Err(e) = state.idempotency.complete(ctx, scope, &record).await {
        warn!(dependency = "kv", error = %e, "failed to store idempotency record");
    }
    Response::from_parts(parts, Body::from(body))
}
