//! Error taxonomy shared by every ridegrid crate.
//!
//! Each crate keeps its own `thiserror` enum; those enums expose `kind()`
//! so the HTTP surface and the logging policy only need to reason about
//! this small set.

use serde::Serialize;

/// How an error propagates and how loudly it is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Validation failure at ingress. Returned verbatim, never reported.
    InvalidInput,
    /// The addressed record does not exist (or its TTL lapsed).
    NotFound,
    /// Out-of-order sample.
    Stale,
    /// Idempotency-key reuse with a different payload, or a lost election.
    Conflict,
    /// Rate or buffer limits.
    QuotaExceeded,
    /// Dependency degraded: breaker open, deadline exceeded, KV unreachable.
    Unavailable,
    /// Unexpected.
    Internal,
    /// Caller-initiated; not an error for reporting purposes.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Stale => "stale",
            ErrorKind::Conflict => "conflict",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Whether the error should reach error telemetry.
    pub fn is_reportable(&self) -> bool {
        matches!(self, ErrorKind::Unavailable | ErrorKind::Internal)
    }

    /// Suggested `Retry-After` seconds, if the caller may retry.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ErrorKind::QuotaExceeded => Some(1),
            ErrorKind::Unavailable => Some(5),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_dependency_and_internal_are_reportable() {
        assert!(ErrorKind::Unavailable.is_reportable());
        assert!(ErrorKind::Internal.is_reportable());
        assert!(!ErrorKind::InvalidInput.is_reportable());
        assert!(!ErrorKind::Cancelled.is_reportable());
        assert!(!ErrorKind::Conflict.is_reportable());
    }

    #[test]
    fn retry_hints() {
        assert_eq!(ErrorKind::QuotaExceeded.retry_after_secs(), Some(1));
        assert_eq!(ErrorKind::Unavailable.retry_after_secs(), Some(5));
        assert_eq!(ErrorKind::Stale.retry_after_secs(), None);
    }
}
