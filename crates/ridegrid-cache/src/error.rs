use ridegrid_core::ErrorKind;
use ridegrid_state::KvError;
use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Kv(#[from] KvError),

    #[error("cache encode error: {0}")]
    Encode(String),

    #[error("cache decode error: {0}")]
    Decode(String),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Kv(e) => e.kind(),
            CacheError::Encode(_) | CacheError::Decode(_) => ErrorKind::Internal,
        }
    }
}
