use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_EMBEDDING_MODEL: &str = "mistral-embed";
pub const DEFAULT_EMBEDDING_ENDPOINT: &str = "https://api.mistral.ai/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        let config = Self {
            chunk_size,
            chunk_overlap,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(PipelineError::InvalidConfig(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Settings for the remote embedding service and the batching discipline around it.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingConfig {
    pub model: String,
    pub endpoint: String,
    /// Hard cap on inputs per request, enforced by the remote service.
    pub max_batch_size: usize,
    /// Minimum spacing between two requests, retries included.
    pub min_request_interval: Duration,
    /// Retries after the first attempt for throttled or transient failures.
    pub max_retries: usize,
    pub initial_backoff: Duration,
    /// Longest wait between attempts, also applied to a server `Retry-After`.
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            endpoint: DEFAULT_EMBEDDING_ENDPOINT.to_string(),
            max_batch_size: 50,
            min_request_interval: Duration::from_secs(1),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "embedding model name is required".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(PipelineError::InvalidConfig(format!(
                "initial_backoff ({:?}) exceeds max_backoff ({:?})",
                self.initial_backoff, self.max_backoff
            )));
        }
        url::Url::parse(&self.endpoint).map_err(|error| {
            PipelineError::InvalidConfig(format!(
                "invalid embedding endpoint {}: {error}",
                self.endpoint
            ))
        })?;
        Ok(())
    }

    /// Backoff before retry number `attempt` (1-based), doubling up to `max_backoff`.
    pub fn backoff_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub store_root: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            store_root: PathBuf::from("data/index_store"),
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunking.chunk_size = size;
        self
    }

    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.config.chunking.chunk_overlap = overlap;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.embedding.model = model.into();
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.embedding.endpoint = endpoint.into();
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.config.embedding.max_batch_size = size;
        self
    }

    pub fn min_request_interval(mut self, interval: Duration) -> Self {
        self.config.embedding.min_request_interval = interval;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.embedding.max_retries = retries;
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.embedding.initial_backoff = initial;
        self.config.embedding.max_backoff = max;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.embedding.request_timeout = timeout;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.config.retrieval.top_k = k;
        self
    }

    pub fn store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.store_root = root.into();
        self
    }

    /// Validates the assembled settings.
    ///
    /// Rejects `chunk_overlap >= chunk_size`, a zero chunk size, a zero batch
    /// size, a zero `top_k`, and unparseable endpoints.
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.chunking.validate()?;
        self.config.embedding.validate()?;
        if self.config.retrieval.top_k == 0 {
            return Err(PipelineError::InvalidConfig(
                "top_k must be greater than zero".to_string(),
            ));
        }
        Ok(self.config)
    }
}
