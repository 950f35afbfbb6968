//! Error taxonomy for the context engine.
//!
//! Errors are classified by how they propagate: transient failures are
//! retried inside the fetcher, rate limits are consumed by the circuit
//! breaker, parse failures drop a single trade, and invariant violations
//! terminate the engine.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network or timeout failure; retried with backoff inside the fetcher.
    #[error("transient error: {0}")]
    Transient(String),

    /// HTTP 418 / 429 / 451 from the exchange; consumed by the circuit breaker.
    #[error("rate limited (http {status})")]
    RateLimited { status: u16 },

    /// HTTP 401 / 403; triggers a one-shot downgrade to public mode.
    #[error("authentication failure: {0}")]
    AuthFailure(String),

    /// Malformed payload for a single record; the record is dropped.
    #[error("parse error: {0}")]
    Parse(String),

    /// A cache file is present but unreadable; the cache is treated as empty.
    #[error("cache corrupt: {0}")]
    CacheCorrupt(String),

    /// Tick size is zero, negative, or absurdly small.
    #[error("invalid tick size: {0}")]
    InvalidTick(String),

    /// Accumulator invariant breached; fatal to the engine.
    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Transient(err.to_string())
    }
}

impl EngineError {
    /// Classify an HTTP status code into the taxonomy.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            418 | 429 | 451 => EngineError::RateLimited { status },
            401 | 403 => EngineError::AuthFailure(format!("http {status}: {body}")),
            _ => EngineError::Transient(format!("http {status}: {body}")),
        }
    }
}
