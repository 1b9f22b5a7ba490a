//! Error types for the Beacon protocol stack.
//!
//! Every failure the dispatch path can produce is a variant here, so callers
//! branch on a typed result instead of catching anything.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the Beacon error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for Beacon components.
#[derive(Error, Debug)]
pub enum Error {
    /// Envelope text did not match the grammar.
    #[error("Decode error at `{token}`: {reason}")]
    Decode { token: String, reason: String },

    /// Structurally valid but semantically inconsistent input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing key material or a signature that does not verify.
    #[error("Signature error: {0}")]
    Signature(String),

    /// The local guard refused the action; nothing was sent.
    #[error("Rate limited locally: {platform}/{action} allowed again in {}s", retry_in.as_secs())]
    RateLimitedLocally {
        platform: String,
        action: String,
        retry_in: Duration,
    },

    /// 401 or 403 from a platform.
    #[error("Authentication error ({status}): {message}")]
    Auth { status: u16, message: String },

    /// 404 from a platform.
    #[error("Not found: {0}")]
    NotFound(String),

    /// 429 from a platform, surfaced only once retries are exhausted.
    #[error("Rate limited remotely: {message}")]
    RateLimitedRemotely {
        retry_after: Option<Duration>,
        message: String,
    },

    /// 5xx from a platform, surfaced only once retries are exhausted.
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Any other 4xx. Never retried.
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Connection failure or per-attempt timeout.
    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    /// No adapter is configured for the requested platform.
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    /// The overall dispatch deadline elapsed. The remote effect is unknown.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a decode error for an offending token.
    pub fn decode(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            token: token.into(),
            reason: reason.into(),
        }
    }

    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the retry engine may try the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::RateLimitedRemotely { .. } | Self::Server { .. } | Self::NetworkTimeout(_)
        )
    }

    /// Server-supplied wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.root() {
            Self::RateLimitedRemotely { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Check if this is an authentication error.
    pub fn is_auth(&self) -> bool {
        matches!(self.root(), Self::Auth { .. })
    }

    /// Check if this is a local or remote rate limit.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self.root(),
            Self::RateLimitedLocally { .. } | Self::RateLimitedRemotely { .. }
        )
    }

    /// Get the HTTP status code that best describes this error.
    pub fn status_code(&self) -> u16 {
        match self.root() {
            Self::Auth { status, .. } | Self::Server { status, .. } | Self::Rejected { status, .. } => {
                *status
            }
            Self::NotFound(_) => 404,
            Self::RateLimitedLocally { .. } | Self::RateLimitedRemotely { .. } => 429,
            Self::Decode { .. } | Self::Validation(_) | Self::Signature(_) => 400,
            Self::NetworkTimeout(_) => 504,
            Self::Timeout(_) => 408,
            _ => 500,
        }
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let auth = Error::Auth {
            status: 403,
            message: "forbidden".into(),
        };
        assert_eq!(auth.status_code(), 403);
        assert_eq!(Error::NotFound("video".into()).status_code(), 404);
        assert_eq!(Error::Validation("bad".into()).status_code(), 400);
        assert_eq!(Error::Config("bad".into()).status_code(), 500);
    }

    #[test]
    fn test_retryable_classes() {
        let server = Error::Server {
            status: 503,
            message: "down".into(),
        };
        assert!(server.is_retryable());
        assert!(Error::NetworkTimeout("reset".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::Rejected {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_context_preserves_classification() {
        let err = Error::RateLimitedRemotely {
            retry_after: Some(Duration::from_secs(2)),
            message: "slow down".into(),
        }
        .with_context("posting bounty");

        assert!(err.is_retryable());
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(err.status_code(), 429);
        assert!(err.to_string().starts_with("posting bounty"));
    }
}
