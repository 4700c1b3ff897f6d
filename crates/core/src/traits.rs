use crate::error::Result;
use async_trait::async_trait;

/// One request to an embedding service: one batch in, one vector per input out.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Model identifier recorded in snapshot metadata.
    fn model(&self) -> &str;

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// The capability the rebuild pipeline and the retriever depend on.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns one vector per input, in input order.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>>;

    fn model_name(&self) -> &str;
}
