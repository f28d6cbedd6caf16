use thiserror::Error;

use ridegrid_core::{DriverId, ErrorKind};
use ridegrid_state::KvError;

pub type GeoResult<T> = Result<T, GeoError>;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("invalid query: {0}")]
    InvalidInput(String),

    #[error("no live presence for driver {0}")]
    NotFound(DriverId),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("corrupt record: {0}")]
    Decode(String),
}

impl GeoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GeoError::InvalidInput(_) => ErrorKind::InvalidInput,
            GeoError::NotFound(_) => ErrorKind::NotFound,
            GeoError::Kv(e) => e.kind(),
            GeoError::Decode(_) => ErrorKind::Internal,
        }
    }
}
