use crate::error::{PipelineError, Result};
use crate::models::RetrievedChunk;
use crate::store::IndexHandle;
use crate::traits::Embedder;
use std::sync::Arc;
use tracing::debug;

/// Read path over the served index: embed the question, return the nearest chunks.
pub struct Retriever<E> {
    embedder: Arc<E>,
    index: IndexHandle,
}

impl<E: Embedder> Retriever<E> {
    pub fn new(embedder: Arc<E>, index: IndexHandle) -> Self {
        Self { embedder, index }
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    /// An empty index yields an empty list, without calling the embedding service.
    pub async fn retrieve(&self, question: &str, k: usize) -> Result<Vec<RetrievedChunk>> {
        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::InvalidArgument("question is empty".to_string()));
        }
        if k == 0 {
            return Err(PipelineError::InvalidArgument(
                "k must be at least 1".to_string(),
            ));
        }

        let store = self.index.snapshot().await;
        if store.is_empty() {
            debug!("index is empty, nothing to retrieve");
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed_one(question).await?;
        let hits = store.search(&query_vector, k)?;
        debug!(k, hits = hits.len(), "retrieved chunks");
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, EventChunk};
    use crate::store::VectorStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Maps a question onto a fixed axis by keyword.
    #[derive(Default)]
    struct KeywordEmbedder {
        queries: AtomicUsize,
    }

    fn axis(text: &str) -> Vec<f32> {
        let lowered = text.to_lowercase();
        vec![
            if lowered.contains("jazz") { 1.0 } else { 0.0 },
            if lowered.contains("théâtre") { 1.0 } else { 0.0 },
            if lowered.contains("enfants") { 1.0 } else { 0.0 },
        ]
    }

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|text| axis(text)).collect())
        }

        async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(axis(text))
        }

        fn model_name(&self) -> &str {
            "keyword"
        }
    }

    fn chunk(id: &str, text: &str) -> EventChunk {
        EventChunk {
            metadata: ChunkMetadata {
                id: id.to_string(),
                title: text.to_string(),
                url: Some(format!("https://openagenda.com/e/{id}")),
                date_start: Some("2025-04-05T20:30:00+02:00".to_string()),
                date_end: Some("2025-04-05T23:00:00+02:00".to_string()),
                city: Some("Paris".to_string()),
                region: "Île-de-France".to_string(),
                keywords: Vec::new(),
            },
            chunk_index: 0,
            page_content: text.to_string(),
        }
    }

    fn served_index() -> Result<IndexHandle> {
        let chunks = vec![
            chunk("1", "Soirée jazz au New Morning"),
            chunk("2", "Théâtre d'improvisation"),
            chunk("3", "Atelier théâtre pour enfants"),
        ];
        let vectors = chunks.iter().map(|chunk| axis(&chunk.page_content)).collect();
        Ok(IndexHandle::new(VectorStore::build(vectors, chunks)?))
    }

    #[tokio::test]
    async fn nearest_chunks_come_first_with_metadata() -> Result<()> {
        let retriever = Retriever::new(Arc::new(KeywordEmbedder::default()), served_index()?);

        let hits = retriever.retrieve("un concert de jazz ?", 2).await?;

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata.id, "1");
        assert_eq!(hits[0].page_content, "Soirée jazz au New Morning");
        assert_eq!(hits[0].score, 0.0);
        assert!(hits[0].score <= hits[1].score);
        Ok(())
    }

    #[tokio::test]
    async fn k_larger_than_index_is_clamped() -> Result<()> {
        let retriever = Retriever::new(Arc::new(KeywordEmbedder::default()), served_index()?);
        let hits = retriever.retrieve("théâtre pour enfants", 25).await?;
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].metadata.id, "3");
        Ok(())
    }

    #[tokio::test]
    async fn empty_index_returns_nothing_without_embedding() -> Result<()> {
        let embedder = Arc::new(KeywordEmbedder::default());
        let retriever = Retriever::new(embedder.clone(), IndexHandle::default());

        let hits = retriever.retrieve("jazz", 5).await?;

        assert!(hits.is_empty());
        assert_eq!(embedder.queries.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn blank_question_and_zero_k_are_rejected() -> Result<()> {
        let retriever = Retriever::new(Arc::new(KeywordEmbedder::default()), served_index()?);
        assert!(matches!(
            retriever.retrieve("   ", 3).await,
            Err(PipelineError::InvalidArgument(_))
        ));
        assert!(matches!(
            retriever.retrieve("jazz", 0).await,
            Err(PipelineError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn retrieval_does_not_mutate_the_index() -> Result<()> {
        let index = served_index()?;
        let retriever = Retriever::new(Arc::new(KeywordEmbedder::default()), index.clone());

        let before = index.snapshot().await;
        retriever.retrieve("jazz", 3).await?;
        let after = index.snapshot().await;

        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.ntotal(), 3);
        Ok(())
    }
}
