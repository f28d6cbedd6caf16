use thiserror::Error;

use ridegrid_core::{ErrorKind, RideId};
use ridegrid_resilience::HttpError;

#[derive(Debug, Error)]
pub enum EtaError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("ride {0} is not tracked")]
    NotTracked(RideId),

    #[error("eta tracker is shutting down")]
    ShuttingDown,
}

impl EtaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EtaError::InvalidInput(_) => ErrorKind::InvalidInput,
            EtaError::NotTracked(_) => ErrorKind::NotFound,
            EtaError::ShuttingDown => ErrorKind::Unavailable,
        }
    }
}

/// A real-time publish that did not go out. Publishing is best-effort; the
/// tracker logs these and retries on the next tick.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("webhook call failed: {0}")]
    Http(#[from] HttpError),

    #[error("breaker {0} is open")]
    BreakerOpen(String),
}
