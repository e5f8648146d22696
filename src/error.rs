//! Error types for the snowcore request execution pipeline.
//!
//! This module defines `SnowError`, the unified error type used throughout
//! the crate, and [`ErrorKind`], the classification consumed by the retry
//! executor to decide whether a failed attempt is worth repeating.
//!
//! # Security
//!
//! Error messages built from external sources must be sanitized so
//! passwords, client secrets, and API keys never leak into logs. Use
//! `sanitize_message()` when constructing such messages.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Coarse classification of a failure, used by the retry policy.
///
/// Constructed once per failed HTTP response or transport error and
/// consumed by the retry executor's policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Credentials rejected (HTTP 401) or token refresh failed.
    Authentication,
    /// Credentials valid but insufficient (HTTP 403).
    Authorization,
    /// Server-side throttling (HTTP 429).
    RateLimit,
    /// Malformed local input or undecodable payload.
    Validation,
    /// Resource does not exist (HTTP 404).
    NotFound,
    /// Request or transport timed out (HTTP 408 or client timeout).
    Timeout,
    /// Connection-level transport failure.
    Network,
    /// Server-side failure (HTTP 5xx).
    Server,
    /// Any other client error (HTTP 4xx).
    Client,
    /// Anything that fits no other bucket.
    Unknown,
}

/// Maps an HTTP status code to an error kind and its retryability.
///
/// Transient statuses (429, 408, 5xx) are retryable; everything else
/// indicates a request that is fundamentally wrong and will not
/// self-resolve.
pub fn classify_status(status: StatusCode) -> (ErrorKind, bool) {
    match status.as_u16() {
        401 => (ErrorKind::Authentication, false),
        403 => (ErrorKind::Authorization, false),
        404 => (ErrorKind::NotFound, false),
        408 => (ErrorKind::Timeout, true),
        429 => (ErrorKind::RateLimit, true),
        400..=499 => (ErrorKind::Client, false),
        500..=599 => (ErrorKind::Server, true),
        _ => (ErrorKind::Unknown, false),
    }
}

/// Unified error type for all snowcore operations.
///
/// Each variant carries enough structure that a caller can distinguish
/// "the server is down" from "your credentials are wrong" without
/// string-parsing the message.
#[derive(Error, Debug)]
pub enum SnowError {
    /// Configuration error - missing or invalid construction values.
    #[error("configuration error: {0}")]
    Config(String),

    /// Input validation failed before any request was made.
    #[error("validation error: {0}")]
    Validation(String),

    /// HTTP client initialization failed.
    #[error("HTTP client error: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// Transport-level failure (connection refused, reset, DNS, TLS).
    #[error("network error during {operation}: {source}")]
    Network {
        /// The operation that failed (e.g., `GET /api/now/table/incident`).
        operation: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out at the transport layer.
    #[error("request timed out after {duration:?} during {operation}")]
    Timeout {
        /// How long we waited before timing out.
        duration: Duration,
        /// The operation that timed out.
        operation: String,
    },

    /// The API returned a non-success status code.
    #[error("ServiceNow API error {status}: {message}")]
    Api {
        /// The HTTP status code returned.
        status: StatusCode,
        /// Classification of the status per the retry table.
        kind: ErrorKind,
        /// Whether the status is considered transient.
        retryable: bool,
        /// Error message, from the structured envelope when present.
        message: String,
        /// Additional detail from the structured envelope, if any.
        detail: Option<String>,
    },

    /// OAuth token refresh failed.
    ///
    /// Always Authentication-kind and never retried, even when the token
    /// endpoint itself returned a 5xx - a broken refresh must surface
    /// immediately rather than loop through the retry budget.
    #[error("token refresh failed: {message}")]
    AuthRefresh {
        /// Sanitized description of the refresh failure.
        message: String,
    },

    /// Refresh was requested but no refresh token is held.
    #[error("no refresh token available - re-run the authorization flow")]
    MissingRefreshToken,

    /// Token store I/O failure.
    #[error("token store error: {0}")]
    TokenStore(#[source] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The operation was cancelled by the caller.
    ///
    /// Distinct from any server-side failure; never retried.
    #[error("operation cancelled: {operation}")]
    Cancelled {
        /// The operation that was cancelled.
        operation: String,
    },

    /// All retry attempts were exhausted.
    ///
    /// The last underlying error is preserved for inspection; `kind()`
    /// and `status()` delegate to it.
    #[error("max retry attempts ({attempts}) exceeded: {source}")]
    RetriesExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        source: Box<SnowError>,
    },
}

impl SnowError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        SnowError::Config(message.into())
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        SnowError::Validation(message.into())
    }

    /// Creates a timeout error.
    pub fn timeout(duration: Duration, operation: impl Into<String>) -> Self {
        SnowError::Timeout {
            duration,
            operation: operation.into(),
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        SnowError::Cancelled {
            operation: operation.into(),
        }
    }

    /// Creates an API error from a status code, classifying it.
    pub fn api(status: StatusCode, message: impl Into<String>, detail: Option<String>) -> Self {
        let (kind, retryable) = classify_status(status);
        SnowError::Api {
            status,
            kind,
            retryable,
            message: message.into(),
            detail,
        }
    }

    /// Returns the classification of this error.
    ///
    /// For exhausted retries this is the kind of the last underlying
    /// error, so callers see what actually kept failing.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SnowError::Config(_) | SnowError::Validation(_) => ErrorKind::Validation,
            SnowError::HttpClient(_) => ErrorKind::Unknown,
            SnowError::Network { .. } => ErrorKind::Network,
            SnowError::Timeout { .. } => ErrorKind::Timeout,
            SnowError::Api { kind, .. } => *kind,
            SnowError::AuthRefresh { .. } | SnowError::MissingRefreshToken => {
                ErrorKind::Authentication
            }
            SnowError::TokenStore(_) => ErrorKind::Unknown,
            SnowError::Serialization(_) => ErrorKind::Validation,
            SnowError::Cancelled { .. } => ErrorKind::Unknown,
            SnowError::RetriesExhausted { source, .. } => source.kind(),
        }
    }

    /// Returns true if this error is transient and eligible for retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            SnowError::Api { retryable, .. } => *retryable,
            SnowError::Timeout { .. } => true,
            // Never retried through exhaustion or cancellation
            SnowError::RetriesExhausted { .. } | SnowError::Cancelled { .. } => false,
            _ => false,
        }
    }

    /// Returns the HTTP status code, if this error carries one.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            SnowError::Api { status, .. } => Some(*status),
            SnowError::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Sanitizes a message to remove any occurrence of a secret.
    ///
    /// Passwords, client secrets, and API keys must never appear in logs
    /// or error messages surfaced to callers.
    #[must_use]
    pub fn sanitize_message(message: &str, secret: &str) -> String {
        if secret.is_empty() {
            return message.to_string();
        }
        message.replace(secret, "[REDACTED]")
    }
}
