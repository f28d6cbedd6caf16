//! Error types for the ridegrid storage adapters.

use ridegrid_core::{ErrorKind, Interrupted};
use ridegrid_resilience::Failure;
use thiserror::Error;

/// Result type alias for sample store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors from the redb sample store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("blocking task failed: {0}")]
    Join(String),

    #[error("sample store write timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}

impl StateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateError::Cancelled => ErrorKind::Cancelled,
            StateError::Serialize(_) | StateError::Deserialize(_) | StateError::Join(_) => {
                ErrorKind::Internal
            }
            _ => ErrorKind::Unavailable,
        }
    }
}

impl From<Interrupted> for StateError {
    fn from(i: Interrupted) -> Self {
        match i {
            Interrupted::Cancelled => StateError::Cancelled,
            Interrupted::DeadlineExceeded => StateError::Timeout,
        }
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// Errors from a [`KvStore`](crate::KvStore). Key absence is never an error.
#[derive(Debug, Clone, Error)]
pub enum KvError {
    #[error("kv connection error: {0}")]
    Connect(String),

    #[error("kv command failed: {0}")]
    Command(String),

    #[error("kv deadline exceeded")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("kv value decode error: {0}")]
    Decode(String),
}

impl KvError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KvError::Cancelled => ErrorKind::Cancelled,
            KvError::Decode(_) => ErrorKind::Internal,
            _ => ErrorKind::Unavailable,
        }
    }

    /// Connection-level failures and timeouts may succeed on a second try.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Connect(_) | KvError::Timeout)
    }
}

impl Failure for KvError {
    fn is_cancellation(&self) -> bool {
        matches!(self, KvError::Cancelled)
    }
}

impl From<Interrupted> for KvError {
    fn from(i: Interrupted) -> Self {
        match i {
            Interrupted::Cancelled => KvError::Cancelled,
            Interrupted::DeadlineExceeded => KvError::Timeout,
        }
    }
}
