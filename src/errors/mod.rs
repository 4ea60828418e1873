//! Error types for the resilience layer.
//!
//! Every caller of a guarded dependency sees one of these failures: the
//! upstream operation's own error, or a failure raised by the layer itself
//! (circuit open, rate limit exceeded, coalesced request timed out).

use std::time::Duration;
use thiserror::Error;

/// Result type for resilience operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Root error type for the resilience layer.
///
/// The type is `Clone` because a single outcome is handed to every caller
/// that joined the same coalesced request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResilienceError {
    /// Error returned by the upstream operation
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Circuit breaker rejected the call without attempting it
    #[error("Circuit breaker open for {dependency}: retry in {retry_after:?}")]
    CircuitOpen {
        /// Guarded dependency
        dependency: String,
        /// Time until the breaker allows a probe
        retry_after: Duration,
    },

    /// Rate limiter denied the call before any attempt
    #[error("Rate limit exceeded for {dependency}: resets in {reset_after:?}")]
    RateLimitExceeded {
        /// Guarded dependency
        dependency: String,
        /// Time until a slot frees up in the window
        reset_after: Duration,
    },

    /// A coalesced request did not resolve within its timeout
    #[error("Request {fingerprint} timed out after {elapsed:?}")]
    RequestTimeout {
        /// Fingerprint of the pending request
        fingerprint: String,
        /// Time waited before giving up
        elapsed: Duration,
    },

    /// The request could not be reduced to a fingerprint
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Why the request has no fingerprint
        message: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

/// How a caller should present a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// The layer protected the dependency; the same call may succeed shortly
    RetryShortly,
    /// The request itself is wrong; repeating it will not help
    Permanent,
    /// The dependency failed transiently and retries were exhausted
    Transient,
}

impl ResilienceError {
    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Upstream(e) => e.error_code(),
            Self::CircuitOpen { .. } => "RESILIENCE_CIRCUIT_OPEN",
            Self::RateLimitExceeded { .. } => "RESILIENCE_RATE_LIMIT",
            Self::RequestTimeout { .. } => "RESILIENCE_REQUEST_TIMEOUT",
            Self::InvalidRequest { .. } => "RESILIENCE_INVALID_REQUEST",
            Self::Configuration(_) => "RESILIENCE_CONFIG",
        }
    }

    /// Check if this error must propagate without consuming retry budget.
    ///
    /// Layer-raised gating errors are never retried: the breaker and the
    /// limiter already decided the attempt should not happen.
    pub fn is_non_retryable(&self) -> bool {
        match self {
            Self::Upstream(e) => e.is_non_retryable(),
            Self::CircuitOpen { .. }
            | Self::RateLimitExceeded { .. }
            | Self::RequestTimeout { .. }
            | Self::InvalidRequest { .. }
            | Self::Configuration(_) => true,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !self.is_non_retryable()
    }

    /// Get retry-after hint if applicable
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Upstream(e) => e.retry_after(),
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            Self::RateLimitExceeded { reset_after, .. } => Some(*reset_after),
            _ => None,
        }
    }

    /// Map the error to a caller-visible experience
    pub fn disposition(&self) -> ErrorDisposition {
        match self {
            Self::CircuitOpen { .. } | Self::RateLimitExceeded { .. } => {
                ErrorDisposition::RetryShortly
            }
            Self::InvalidRequest { .. } | Self::Configuration(_) => ErrorDisposition::Permanent,
            Self::Upstream(e) if e.is_non_retryable() => ErrorDisposition::Permanent,
            Self::Upstream(_) | Self::RequestTimeout { .. } => ErrorDisposition::Transient,
        }
    }
}

/// Errors produced by an upstream operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Credentials missing or rejected
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Error message
        message: String,
    },

    /// Credentials valid but access denied
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Error message
        message: String,
    },

    /// The request was malformed
    #[error("Bad request: {message}")]
    BadRequest {
        /// Error message
        message: String,
    },

    /// The requested resource does not exist
    #[error("Not found: {message}")]
    NotFound {
        /// Error message
        message: String,
    },

    /// The upstream throttled the call
    #[error("Too many requests: {message}")]
    TooManyRequests {
        /// Error message
        message: String,
        /// Server-provided wait hint
        retry_after: Option<Duration>,
    },

    /// The call timed out
    #[error("Timeout: {message}")]
    Timeout {
        /// Error message
        message: String,
    },

    /// 5xx-class failure
    #[error("Server error (HTTP {status}): {message}")]
    Server {
        /// Status code reported by the upstream
        status: u16,
        /// Error message
        message: String,
    },

    /// Connection failed or was reset
    #[error("Connection error: {message}")]
    Connection {
        /// Error message
        message: String,
    },

    /// The operation was aborted before producing an outcome
    #[error("Operation aborted: {message}")]
    Aborted {
        /// Error message
        message: String,
    },

    /// Any other failure
    #[error("Upstream failure: {message}")]
    Other {
        /// Error message
        message: String,
    },
}

impl UpstreamError {
    /// Create an error from an HTTP-like status code
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();

        match status {
            400 | 422 => Self::BadRequest { message },
            401 => Self::Unauthorized { message },
            403 => Self::Forbidden { message },
            404 | 410 => Self::NotFound { message },
            408 | 504 => Self::Timeout { message },
            429 => Self::TooManyRequests {
                message,
                retry_after: None,
            },
            500..=599 => Self::Server { status, message },
            _ => Self::Other { message },
        }
    }

    /// Create a transient error with a plain message
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "UPSTREAM_UNAUTHORIZED",
            Self::Forbidden { .. } => "UPSTREAM_FORBIDDEN",
            Self::BadRequest { .. } => "UPSTREAM_BAD_REQUEST",
            Self::NotFound { .. } => "UPSTREAM_NOT_FOUND",
            Self::TooManyRequests { .. } => "UPSTREAM_TOO_MANY_REQUESTS",
            Self::Timeout { .. } => "UPSTREAM_TIMEOUT",
            Self::Server { .. } => "UPSTREAM_SERVER",
            Self::Connection { .. } => "UPSTREAM_CONNECTION",
            Self::Aborted { .. } => "UPSTREAM_ABORTED",
            Self::Other { .. } => "UPSTREAM_OTHER",
        }
    }

    /// Unauthorized, Forbidden, BadRequest and NotFound are never retried
    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized { .. }
                | Self::Forbidden { .. }
                | Self::BadRequest { .. }
                | Self::NotFound { .. }
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !self.is_non_retryable()
    }

    /// Get retry-after duration if applicable
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TooManyRequests { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A setting holds an unusable value
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Setting name
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// Environment variable could not be parsed
    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

impl ConfigurationError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(400, false ; "bad request")]
    #[test_case(401, false ; "unauthorized")]
    #[test_case(403, false ; "forbidden")]
    #[test_case(404, false ; "not found")]
    #[test_case(429, true ; "too many requests")]
    #[test_case(500, true ; "internal error")]
    #[test_case(503, true ; "unavailable")]
    #[test_case(504, true ; "gateway timeout")]
    fn test_status_classification(status: u16, retryable: bool) {
        let error = UpstreamError::from_status(status, "boom");
        assert_eq!(error.is_retryable(), retryable);
    }

    #[test]
    fn test_layer_errors_are_not_retried() {
        let open = ResilienceError::CircuitOpen {
            dependency: "gemini".to_string(),
            retry_after: Duration::from_secs(1),
        };
        let limited = ResilienceError::RateLimitExceeded {
            dependency: "gemini".to_string(),
            reset_after: Duration::from_secs(1),
        };

        assert!(open.is_non_retryable());
        assert!(limited.is_non_retryable());
        assert_eq!(open.disposition(), ErrorDisposition::RetryShortly);
        assert_eq!(limited.disposition(), ErrorDisposition::RetryShortly);

        let invalid = ResilienceError::InvalidRequest {
            message: "key must be a string".to_string(),
        };
        assert!(invalid.is_non_retryable());
        assert_eq!(invalid.disposition(), ErrorDisposition::Permanent);
        assert_eq!(invalid.error_code(), "RESILIENCE_INVALID_REQUEST");
    }

    #[test]
    fn test_disposition() {
        let hard = ResilienceError::from(UpstreamError::from_status(403, "denied"));
        let soft = ResilienceError::from(UpstreamError::from_status(502, "bad gateway"));

        assert_eq!(hard.disposition(), ErrorDisposition::Permanent);
        assert_eq!(soft.disposition(), ErrorDisposition::Transient);
        assert_eq!(hard.error_code(), "UPSTREAM_FORBIDDEN");
    }

    #[test]
    fn test_retry_after_hint() {
        let error = UpstreamError::TooManyRequests {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(error.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(
            ResilienceError::from(error).retry_after(),
            Some(Duration::from_secs(2))
        );
    }
}
