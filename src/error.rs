// Error taxonomy shared across the pipeline

use std::time::Duration;

use thiserror::Error;

use crate::types::Provider;

pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a provider-side failure, used by the retry policy to
/// decide whether an attempt may be repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    /// HTTP 429 or an explicit throttle signal. Retryable.
    RateLimited,
    /// Invalid or missing credentials (401/403). Never retried.
    Unauthorized,
    /// The request itself was rejected (400/404/422). Never retried.
    InvalidRequest,
    /// Connection failures, 5xx responses, truncated bodies. Retryable.
    Transient,
    /// Anything the transport could not classify.
    Unknown,
}

impl ProviderErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient)
    }
}

/// A failed call to an external text-generation provider, already mapped
/// onto the shared taxonomy by the transport that observed it.
#[derive(Debug, Clone, Error)]
#[error("{provider}/{model} {kind:?}: {message}")]
pub struct ProviderError {
    pub provider: Provider,
    pub model: String,
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(
        provider: Provider,
        model: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        ProviderError {
            provider,
            model: model.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Which bound was exceeded. Batch reporting distinguishes "throttled"
/// (rate-limiter acquisition) from "provider unresponsive" (invocation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    RateLimit,
    Provider,
    Batch,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::RateLimit => write!(f, "rate limiter acquisition"),
            TimeoutKind::Provider => write!(f, "provider invocation"),
            TimeoutKind::Batch => write!(f, "batch deadline"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown pseudonym '{pseudonym_id}' in scope '{scope}'")]
    NotFound { scope: String, pseudonym_id: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{provider}/{model} response does not match the expected schema: {message}")]
    Schema {
        provider: Provider,
        model: String,
        message: String,
    },

    #[error("{kind} exceeded its bound of {limit:?}")]
    Timeout { kind: TimeoutKind, limit: Duration },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("identity store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("privacy error: {0}")]
    Privacy(String),

    #[error("batch '{batch_id}' was cancelled before this item was scheduled")]
    Cancelled { batch_id: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True only for failures the retry policy is allowed to repeat.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Provider(p) if p.kind.is_retryable())
    }
}
