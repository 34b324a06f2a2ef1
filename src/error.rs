//! Error types for the metashelf lookup pipeline

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the lookup pipeline.
///
/// The variants mirror the upstream catalog API's failure taxonomy so the
/// dispatcher can decide between retrying and failing terminally. The enum
/// is `Clone` because a single terminal outcome is broadcast to every
/// waiter attached to an in-flight lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Upstream failures (permanent)
    // =========================================================================
    /// The upstream catalog has no record for this key
    #[error("{entity} '{key}' does not exist upstream")]
    NotFound { entity: String, key: String },

    /// The upstream rejected the request as malformed (4xx other than 404/429)
    #[error("upstream rejected request: {0}")]
    BadRequest(String),

    // =========================================================================
    // Upstream failures (transient)
    // =========================================================================
    /// The upstream throttled us; honor `retry_after` when present
    #[error("upstream rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The per-attempt upstream timeout fired
    #[error("upstream request timed out")]
    Timeout,

    /// Connection-level failure talking to the upstream
    #[error("upstream network error: {0}")]
    Network(String),

    /// Upstream returned a 5xx response
    #[error("upstream server error: HTTP {status}")]
    Server { status: u16 },

    // =========================================================================
    // Pipeline outcomes
    // =========================================================================
    /// Transient failures exhausted the retry budget
    #[error("lookup failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    /// The caller's deadline or cancellation token fired while waiting.
    /// Local to one waiter; the underlying job keeps running.
    #[error("lookup cancelled by caller")]
    Cancelled,

    /// The dispatcher is draining; queued jobs are resolved with this so
    /// no caller hangs
    #[error("lookup pipeline shutting down")]
    ShuttingDown,

    /// Upstream lookups are disabled by configuration
    #[error("upstream lookups are disabled")]
    Disabled,

    // =========================================================================
    // Local errors
    // =========================================================================
    /// The identifier normalizes to nothing usable
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Local store read/write failure
    #[error("local store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry of the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::Timeout | Error::Network(_) | Error::Server { .. }
        )
    }

    /// Whether the failure is terminal for this key (retrying cannot help).
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::BadRequest(_))
    }

    /// Upstream-suggested retry delay, if it sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout.is_transient());
        assert!(Error::Network("reset".into()).is_transient());
        assert!(Error::Server { status: 503 }.is_transient());
        assert!(Error::RateLimited { retry_after: None }.is_transient());

        assert!(!Error::Timeout.is_permanent());
    }

    #[test]
    fn test_permanent_classification() {
        let not_found = Error::NotFound {
            entity: "book".into(),
            key: "9780000000000".into(),
        };
        assert!(not_found.is_permanent());
        assert!(!not_found.is_transient());

        assert!(Error::BadRequest("bad isbn".into()).is_permanent());
    }

    #[test]
    fn test_pipeline_outcomes_are_neither() {
        for err in [
            Error::Cancelled,
            Error::ShuttingDown,
            Error::Disabled,
            Error::Exhausted {
                attempts: 3,
                last: "timeout".into(),
            },
        ] {
            assert!(!err.is_transient());
            assert!(!err.is_permanent());
        }
    }

    #[test]
    fn test_retry_after_passthrough() {
        let err = Error::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(Error::Timeout.retry_after(), None);
    }

    #[test]
    fn test_display_messages() {
        let err = Error::NotFound {
            entity: "author".into(),
            key: "jane austen".into(),
        };
        assert_eq!(
            err.to_string(),
            "author 'jane austen' does not exist upstream"
        );

        let err = Error::Exhausted {
            attempts: 3,
            last: "upstream request timed out".into(),
        };
        assert!(err.to_string().contains("after 3 attempts"));
    }
}
