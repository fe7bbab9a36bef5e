//! Provider error taxonomy.
//!
//! The engine never parses provider-specific error bodies itself; the chat
//! client surfaces a `ClientError`, and `ErrorCategory` tells the retry
//! executor whether the failure is worth another attempt.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a chat-client implementation.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("content policy violation: {0}")]
    ContentPolicy(String),

    #[error("response format error: {message}")]
    ResponseFormat {
        message: String,
        raw_response: String,
    },

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Json(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}

/// Coarse classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    RateLimit,
    Timeout,
    Network,
    Server,
    Auth,
    InvalidRequest,
    ContentPolicy,
    Unknown,
}

impl ErrorCategory {
    /// Transient categories are eligible for retry; permanent ones are
    /// surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimit
                | ErrorCategory::Timeout
                | ErrorCategory::Network
                | ErrorCategory::Server
        )
    }
}

impl ClientError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ClientError::Http(_) => ErrorCategory::Network,
            ClientError::Auth(_) => ErrorCategory::Auth,
            ClientError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            ClientError::RateLimited { .. } => ErrorCategory::RateLimit,
            ClientError::Timeout(_) => ErrorCategory::Timeout,
            ClientError::Server(_) => ErrorCategory::Server,
            ClientError::ContentPolicy(_) => ErrorCategory::ContentPolicy,
            ClientError::ResponseFormat { .. } | ClientError::Json(_) => ErrorCategory::Unknown,
        }
    }

    /// Provider-suggested delay before the next attempt, when known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_transient_with_retry_after() {
        let err = ClientError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.category(), ErrorCategory::RateLimit);
        assert!(err.category().is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn auth_and_invalid_request_are_permanent() {
        assert!(!ClientError::Auth("bad key".into()).category().is_transient());
        assert!(
            !ClientError::InvalidRequest("malformed".into())
                .category()
                .is_transient()
        );
        assert!(
            !ClientError::ContentPolicy("blocked".into())
                .category()
                .is_transient()
        );
    }

    #[test]
    fn http_and_server_errors_are_transient() {
        assert!(ClientError::Http("connection reset".into())
            .category()
            .is_transient());
        assert!(ClientError::Server("502".into()).category().is_transient());
        assert!(ClientError::Timeout("30s".into()).category().is_transient());
    }

    #[test]
    fn display_messages_are_human_readable() {
        assert_eq!(
            ClientError::Timeout("30s elapsed".into()).to_string(),
            "request timed out: 30s elapsed"
        );
        assert_eq!(
            ClientError::Auth("expired token".into()).to_string(),
            "auth error: expired token"
        );
    }
}
