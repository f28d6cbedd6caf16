use thiserror::Error;

use ridegrid_core::{ErrorKind, Interrupted};
use ridegrid_resilience::{Failure, HttpError};

/// A map provider call that did not produce an answer.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The provider answered but refused the request (quota, credentials).
    #[error("provider rejected request: {0}")]
    Rejected(String),

    #[error("no map provider configured")]
    Unconfigured,

    #[error("provider call timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}

impl Failure for ProviderError {
    fn is_cancellation(&self) -> bool {
        matches!(self, ProviderError::Cancelled | ProviderError::Http(HttpError::Cancelled))
    }
}

impl From<Interrupted> for ProviderError {
    fn from(i: Interrupted) -> Self {
        match i {
            Interrupted::Cancelled => ProviderError::Cancelled,
            Interrupted::DeadlineExceeded => ProviderError::Timeout,
        }
    }
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("invalid geocode request: {0}")]
    InvalidInput(String),

    #[error("no geocoding result")]
    NotFound,

    #[error("geocoding provider '{dependency}' unavailable: circuit open")]
    BreakerOpen { dependency: String },

    #[error("geocoding provider '{dependency}' failed: {source}")]
    Provider {
        dependency: String,
        #[source]
        source: ProviderError,
    },

    #[error("cancelled")]
    Cancelled,
}

impl GeocodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GeocodeError::InvalidInput(_) => ErrorKind::InvalidInput,
            GeocodeError::NotFound => ErrorKind::NotFound,
            GeocodeError::BreakerOpen { .. } | GeocodeError::Provider { .. } => ErrorKind::Unavailable,
            GeocodeError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Name of the failing dependency, for telemetry.
    pub fn dependency(&self) -> Option<&str> {
        match self {
            GeocodeError::BreakerOpen { dependency } | GeocodeError::Provider { dependency, .. } => {
                Some(dependency)
            }
            _ => None,
        }
    }
}
