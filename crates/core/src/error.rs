use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("embedding service throttled the request")]
    RateLimitExceeded { retry_after: Option<Duration> },

    #[error("embedding failed after {attempts} attempt(s): {reason}")]
    EmbeddingFailure { attempts: usize, reason: String },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("corrupt index at {path}: {details}")]
    CorruptIndex { path: String, details: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("index store {path} is locked by another rebuild")]
    StoreBusy { path: String },

    #[error("embedding service returned {status}: {body}")]
    ServiceStatus { status: u16, body: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PipelineError {
    pub fn corrupt(path: impl AsRef<std::path::Path>, details: impl Into<String>) -> Self {
        Self::CorruptIndex {
            path: path.as_ref().display().to_string(),
            details: details.into(),
        }
    }

    /// Whether the embedding client should retry the request that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimitExceeded { .. } => true,
            Self::ServiceStatus { status, .. } => *status >= 500,
            Self::Http(error) => error.is_timeout() || error.is_connect() || error.is_request(),
            _ => false,
        }
    }

    /// Server-suggested wait before the next attempt, when there is one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
