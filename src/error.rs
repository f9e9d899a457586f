//! Error types shared across the collector.
//!
//! The layering mirrors the propagation policy:
//! - `ProviderError`: one upstream call
//! - `CollectError`: one race (always caught at the race boundary)
//! - `PipelineError`: the whole invocation (surfaces as HTTP 500)

use thiserror::Error;

// ------------------------------------------------------------
// Provider errors
// ------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid race id '{0}'")]
    InvalidRaceId(String),
}

impl ProviderError {
    /// Structured retry classification.
    ///
    /// Retryable: network failures, timeouts, HTTP 5xx, HTTP 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => *status == 429 || (500..=599).contains(status),
            ProviderError::Network(_) | ProviderError::Timeout(_) => true,
            ProviderError::InvalidPayload(_) | ProviderError::InvalidRaceId(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::Http {
                status: status.as_u16(),
                body: String::new(),
            }
        } else if err.is_decode() {
            ProviderError::InvalidPayload(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

// ------------------------------------------------------------
// Store errors
// ------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// ------------------------------------------------------------
// Per-race collection errors
// ------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("invalid race id '{0}'")]
    InvalidRaceId(String),

    #[error("race '{0}' not found")]
    UnknownRace(String),

    #[error("no provider registered for race type '{0}'")]
    UnsupportedRaceType(String),

    #[error("provider {provider} failed after {attempts} attempt(s): {cause}")]
    Provider {
        provider: &'static str,
        attempts: u32,
        cause: anyhow::Error,
    },

    #[error("payload mapping failed: {0}")]
    Mapping(#[source] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CollectError {
    /// Validation failures are never retried and never escalated.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CollectError::InvalidRaceId(_) | CollectError::UnsupportedRaceType(_)
        )
    }
}

// ------------------------------------------------------------
// Invocation-level errors
// ------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("race listing failed: {0}")]
    RaceListing(#[source] StoreError),

    #[error("state store failed: {0}")]
    State(#[source] StoreError),
}
