//! HTTP error mapping.
//!
//! Every crate error converts into [`ApiError`] through its `kind()`; the
//! kind decides the status code, the `Retry-After` hint, and how loudly the
//! failure is logged.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use ridegrid_cache::CacheError;
use ridegrid_core::ErrorKind;
use ridegrid_eta::EtaError;
use ridegrid_geo::GeoError;
use ridegrid_geocode::GeocodeError;
use ridegrid_ingest::SubmitError;
use ridegrid_state::KvError;

/// Non-standard "client closed request".
const CLIENT_CLOSED: u16 = 499;

#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    dependency: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    error: &'a str,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            dependency: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn unavailable(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message).with_dependency(dependency)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Stale | ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Cancelled => StatusCode::from_u16(CLIENT_CLOSED).unwrap_or(StatusCode::BAD_REQUEST),
        }
    }

    fn log(&self) {
        let dependency = self.dependency.as_deref().unwrap_or("none");
        match self.kind {
            ErrorKind::InvalidInput | ErrorKind::NotFound => {}
            ErrorKind::Stale | ErrorKind::Conflict | ErrorKind::QuotaExceeded => {
                info!(kind = %self.kind, error = %self.message, "request refused");
            }
            ErrorKind::Unavailable => {
                warn!(kind = %self.kind, dependency, error = %self.message, "dependency unavailable");
            }
            ErrorKind::Internal => {
                error!(kind = %self.kind, error = %self.message, "internal error");
            }
            ErrorKind::Cancelled => debug!(error = %self.message, "request cancelled"),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.log();
        let mut response = (
            self.status(),
            Json(ErrorBody {
                success: false,
                error: &self.message,
            }),
        )
            .into_response();
        if let Some(secs) = self.kind.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        let err = ApiError::new(e.kind(), e.to_string());
        match e {
            SubmitError::ShuttingDown => err.with_dependency("ingest"),
            _ => err,
        }
    }
}

impl From<GeoError> for ApiError {
    fn from(e: GeoError) -> Self {
        let err = ApiError::new(e.kind(), e.to_string());
        match e {
            GeoError::Kv(_) => err.with_dependency("kv"),
            _ => err,
        }
    }
}

impl From<GeocodeError> for ApiError {
    fn from(e: GeocodeError) -> Self {
        let dependency = e.dependency().map(str::to_string);
        let err = ApiError::new(e.kind(), e.to_string());
        match dependency {
            Some(dep) => err.with_dependency(dep),
            None => err,
        }
    }
}

impl From<EtaError> for ApiError {
    fn from(e: EtaError) -> Self {
        ApiError::new(e.kind(), e.to_string())
    }
}

impl From<KvError> for ApiError {
    fn from(e: KvError) -> Self {
        ApiError::new(e.kind(), e.to_string()).with_dependency("kv")
    }
}

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        ApiError::new(e.kind(), e.to_string()).with_dependency("kv")
    }
}
