//! Error taxonomy for the zone check core
//!
//! Every fallible operation in the crate returns [`ZoneError`]. The type is
//! `Clone` because a single in-flight refresh hands the same outcome to every
//! waiter.
//!
//! Callers outside the core only ever need three buckets, exposed through
//! [`ZoneError::kind`]:
//!
//! - [`ErrorKind::Validation`] - the request itself was bad
//! - [`ErrorKind::RateLimited`] - the caller should back off until `reset_at`
//! - [`ErrorKind::Unavailable`] - try again later

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced by the zone check core
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ZoneError {
    /// Required source location or credentials are missing
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Dataset fetch failed (network, HTTP status, IO)
    #[error("Dataset source unavailable: {0}")]
    SourceUnavailable(String),

    /// Fetched document failed structural validation
    #[error("Malformed dataset: {0}")]
    MalformedDataset(String),

    /// Spatial index construction violated an internal invariant
    #[error("Index build failed: {0}")]
    IndexBuild(String),

    /// A query backend failed
    #[error("Backend {backend} unavailable: {message}")]
    BackendUnavailable {
        /// Backend name
        backend: String,
        /// Failure description
        message: String,
    },

    /// Caller exceeded its request quota for the current window
    #[error("Rate limit exceeded: {limit} requests per window, resets at {reset_at}")]
    RateLimitExceeded {
        /// Requests allowed per window
        limit: u32,
        /// Requests remaining in the window (always 0 when rejected)
        remaining: u32,
        /// When the current window ends
        reset_at: DateTime<Utc>,
    },

    /// Shared store unreachable or returned an error
    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    /// Operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Input failed validation
    #[error("Invalid input: {0}")]
    Validation(String),
}

/// User-visible classification of a [`ZoneError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request
    Validation,
    /// Quota exhausted
    RateLimited,
    /// Temporarily unavailable
    Unavailable,
}

impl ZoneError {
    /// Whether retrying the same operation could plausibly succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_) | Self::Timeout(_))
    }

    /// Classify for callers outside the core
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimited,
            _ => ErrorKind::Unavailable,
        }
    }

    pub(crate) fn backend(backend: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            message: message.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for ZoneError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::IndexBuild(format!("background task aborted: {err}"))
    }
}

/// Result alias used throughout the crate
pub type ZoneResult<T> = Result<T, ZoneError>;
