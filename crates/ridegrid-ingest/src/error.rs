use chrono::{DateTime, Utc};
use thiserror::Error;

use ridegrid_core::ErrorKind;
use ridegrid_core::types::PointError;

/// Which limit a rejected submission ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaReason {
    DriverRate,
    GlobalBuffer,
}

impl std::fmt::Display for QuotaReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaReason::DriverRate => f.write_str("per-driver rate limit"),
            QuotaReason::GlobalBuffer => f.write_str("global buffer full"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmitError {
    #[error("invalid point: {0}")]
    InvalidPoint(#[from] PointError),

    #[error("sample at {got} is older than last accepted {last}")]
    Stale {
        last: DateTime<Utc>,
        got: DateTime<Utc>,
    },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(QuotaReason),

    #[error("ingestion pipeline is shutting down")]
    ShuttingDown,
}

impl SubmitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubmitError::InvalidPoint(_) => ErrorKind::InvalidInput,
            SubmitError::Stale { .. } => ErrorKind::Stale,
            SubmitError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            SubmitError::ShuttingDown => ErrorKind::Unavailable,
        }
    }
}
