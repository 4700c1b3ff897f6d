use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};
use crate::traits::{Embedder, EmbeddingBackend};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

pub const DEFAULT_NGRAM_DIMENSIONS: usize = 128;

/// Batches, spaces and retries requests to an [`EmbeddingBackend`].
///
/// Every request, retries included, goes through a single gate: a caller
/// waits until `min_request_interval` has elapsed since the previous request
/// finished. Concurrent callers queue on the gate instead of fanning out.
pub struct EmbeddingClient<B> {
    backend: B,
    config: EmbeddingConfig,
    last_request: Mutex<Option<Instant>>,
}

impl<B: EmbeddingBackend> EmbeddingClient<B> {
    pub fn new(backend: B, config: EmbeddingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            last_request: Mutex::new(None),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    async fn send_spaced(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_request = self.last_request.lock().await;
        if let Some(previous) = *last_request {
            sleep_until(previous + self.config.min_request_interval).await;
        }
        let outcome = self.backend.embed_batch(batch).await;
        *last_request = Some(Instant::now());
        outcome
    }

    async fn request(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut retries = 0usize;
        loop {
            match self.send_spaced(batch).await {
                Ok(vectors) if vectors.len() == batch.len() => return Ok(vectors),
                Ok(vectors) => {
                    return Err(PipelineError::EmbeddingFailure {
                        attempts: retries + 1,
                        reason: format!(
                            "{} returned {} embeddings for {} inputs",
                            self.backend.model(),
                            vectors.len(),
                            batch.len()
                        ),
                    });
                }
                Err(error) if error.is_retryable() && retries < self.config.max_retries => {
                    retries += 1;
                    let wait = error
                        .retry_after()
                        .map(|wait| wait.min(self.config.max_backoff))
                        .unwrap_or_else(|| self.config.backoff_for(retries));
                    warn!(
                        model = self.backend.model(),
                        retry = retries,
                        wait_ms = wait.as_millis() as u64,
                        reason = %error,
                        "embedding request failed, retrying"
                    );
                    sleep(wait).await;
                }
                Err(PipelineError::EmbeddingFailure { reason, .. }) => {
                    return Err(PipelineError::EmbeddingFailure {
                        attempts: retries + 1,
                        reason,
                    });
                }
                Err(error) => {
                    return Err(PipelineError::EmbeddingFailure {
                        attempts: retries + 1,
                        reason: error.to_string(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl<B: EmbeddingBackend> Embedder for EmbeddingClient<B> {
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        let batch_count = texts.len().div_ceil(self.config.max_batch_size);

        for (position, batch) in texts.chunks(self.config.max_batch_size).enumerate() {
            debug!(
                batch = position + 1,
                of = batch_count,
                size = batch.len(),
                "embedding batch"
            );
            vectors.extend(self.request(batch).await?);
        }

        Ok(vectors)
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| PipelineError::EmbeddingFailure {
            attempts: 1,
            reason: "empty embedding response".to_string(),
        })
    }

    fn model_name(&self) -> &str {
        self.backend.model()
    }
}

/// Deterministic offline backend hashing character trigrams into buckets.
#[derive(Debug, Clone)]
pub struct CharacterNgramBackend {
    dimensions: usize,
    model: String,
}

impl Default for CharacterNgramBackend {
    fn default() -> Self {
        Self::new(DEFAULT_NGRAM_DIMENSIONS)
    }
}

impl CharacterNgramBackend {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model: format!("char-trigram-{dimensions}"),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for ch in window {
                let mut buffer = [0u8; 4];
                for byte in ch.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingBackend for CharacterNgramBackend {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|text| self.embed(text)).collect())
    }
}
