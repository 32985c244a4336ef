//! Chunk processor error taxonomy.
//!
//! Every failure coming out of a chunk processor is classified into an
//! [`ErrorKind`]. Transient kinds are retried by the retry policy;
//! permanent kinds fail the chunk on the spot.

use serde::{Deserialize, Serialize};

/// Classification of a chunk processing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // -- transient --
    /// The processor did not answer within the configured timeout.
    Timeout,
    /// The connection to the upstream service dropped.
    ConnectionReset,
    /// The upstream service asked us to slow down.
    RateLimited,
    /// The upstream service is temporarily unavailable (5xx).
    Unavailable,
    /// The worker holding the chunk disappeared before finishing.
    LeaseExpired,

    // -- permanent --
    /// The payload cannot be processed as given.
    InvalidPayload,
    /// The upstream service refused our credentials.
    Unauthorized,
    /// The upstream service rejected the request for any other reason.
    Rejected,
}

impl ErrorKind {
    /// `true` for failures that may succeed when retried.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::ConnectionReset
                | ErrorKind::RateLimited
                | ErrorKind::Unavailable
                | ErrorKind::LeaseExpired
        )
    }

    /// String representation for database storage.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionReset => "connection_reset",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::LeaseExpired => "lease_expired",
            ErrorKind::InvalidPayload => "invalid_payload",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Rejected => "rejected",
        }
    }

    /// Parse from the stored string, `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timeout" => Some(ErrorKind::Timeout),
            "connection_reset" => Some(ErrorKind::ConnectionReset),
            "rate_limited" => Some(ErrorKind::RateLimited),
            "unavailable" => Some(ErrorKind::Unavailable),
            "lease_expired" => Some(ErrorKind::LeaseExpired),
            "invalid_payload" => Some(ErrorKind::InvalidPayload),
            "unauthorized" => Some(ErrorKind::Unauthorized),
            "rejected" => Some(ErrorKind::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed chunk processor invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ChunkError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ChunkError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionReset, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPayload, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_permanent_kinds_are_disjoint() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::RateLimited.is_transient());
        assert!(ErrorKind::ConnectionReset.is_transient());
        assert!(!ErrorKind::InvalidPayload.is_transient());
        assert!(!ErrorKind::Unauthorized.is_transient());
        assert!(!ErrorKind::Rejected.is_transient());
    }

    #[test]
    fn kind_string_round_trip() {
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::ConnectionReset,
            ErrorKind::RateLimited,
            ErrorKind::Unavailable,
            ErrorKind::LeaseExpired,
            ErrorKind::InvalidPayload,
            ErrorKind::Unauthorized,
            ErrorKind::Rejected,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = ChunkError::timeout("no answer after 30s");
        assert_eq!(err.to_string(), "timeout: no answer after 30s");
        assert!(err.is_transient());
    }
}
