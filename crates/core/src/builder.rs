use crate::chunking::TextChunker;
use crate::config::ChunkingConfig;
use crate::error::{PipelineError, Result};
use crate::models::{EventChunk, EventRecord};
use crate::snapshot::SnapshotStore;
use crate::store::{IndexHandle, VectorStore};
use crate::traits::Embedder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RebuildOutcome {
    pub location: PathBuf,
    pub documents: usize,
    pub chunks: usize,
    pub dimension: usize,
    /// Records whose text produced no chunks.
    pub empty_documents: Vec<String>,
}

/// Chunk, embed, build and publish a fresh index generation.
pub struct IndexBuilder<E> {
    embedder: Arc<E>,
    chunker: TextChunker,
    snapshots: SnapshotStore,
}

impl<E: Embedder> IndexBuilder<E> {
    pub fn new(embedder: Arc<E>, chunking: ChunkingConfig, snapshots: SnapshotStore) -> Result<Self> {
        Ok(Self {
            embedder,
            chunker: TextChunker::new(chunking)?,
            snapshots,
        })
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Rebuilds from `documents` and returns where the new generation lives.
    ///
    /// Nothing touches the live generation until the staged snapshot has been
    /// reloaded and its vector and metadata counts agree. The store root stays
    /// locked from the first staging step to the final prune, so a concurrent
    /// rebuild fails with [`PipelineError::StoreBusy`] instead of interleaving.
    pub async fn rebuild(&self, documents: &[EventRecord]) -> Result<RebuildOutcome> {
        let (outcome, _) = self.build_and_publish(documents).await?;
        Ok(outcome)
    }

    /// Rebuilds and then swaps the published store into `handle`.
    pub async fn rebuild_and_serve(
        &self,
        documents: &[EventRecord],
        handle: &IndexHandle,
    ) -> Result<RebuildOutcome> {
        let (outcome, store) = self.build_and_publish(documents).await?;
        handle.replace(store).await;
        info!(location = %outcome.location.display(), "serving rebuilt index");
        Ok(outcome)
    }

    async fn build_and_publish(
        &self,
        documents: &[EventRecord],
    ) -> Result<(RebuildOutcome, VectorStore)> {
        if documents.is_empty() {
            return Err(PipelineError::Validation(
                "no source documents to index".to_string(),
            ));
        }

        let (chunks, empty_documents) = self.chunk_documents(documents);
        if chunks.is_empty() {
            return Err(PipelineError::Validation(format!(
                "{} source documents produced no chunks",
                documents.len()
            )));
        }
        info!(
            documents = documents.len(),
            chunks = chunks.len(),
            empty = empty_documents.len(),
            "chunked source documents"
        );

        let _lock = self.snapshots.lock()?;
        let purged = self.snapshots.purge_stale_staging()?;
        if purged > 0 {
            warn!(purged, "removed staging left by an abandoned rebuild");
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.page_content.clone()).collect();
        let vectors = self.embedder.embed_many(&texts).await?;
        let store = VectorStore::build(vectors, chunks)?.with_model(self.embedder.model_name());
        info!(
            ntotal = store.ntotal(),
            dimension = store.dimension(),
            model = store.model(),
            "built vector index"
        );

        let staging = self.snapshots.stage()?;
        let verified = match stage_snapshot(&store, &staging) {
            Ok(verified) => verified,
            Err(error) => {
                if let Err(cleanup) = self.snapshots.discard(&staging) {
                    warn!(path = %staging.display(), reason = %cleanup, "unable to discard staging");
                }
                return Err(error);
            }
        };
        let location = self.snapshots.commit(&staging)?;

        let outcome = RebuildOutcome {
            location,
            documents: documents.len(),
            chunks: verified.ntotal(),
            dimension: verified.dimension(),
            empty_documents,
        };
        Ok((outcome, verified))
    }

    fn chunk_documents(&self, documents: &[EventRecord]) -> (Vec<EventChunk>, Vec<String>) {
        let mut chunks = Vec::new();
        let mut empty_documents = Vec::new();

        for document in documents {
            let before = chunks.len();
            chunks.extend(self.chunker.chunk_record(document));
            if chunks.len() == before {
                warn!(id = %document.id, "document text is empty, skipping");
                empty_documents.push(document.id.clone());
            }
        }

        (chunks, empty_documents)
    }
}

fn stage_snapshot(store: &VectorStore, staging: &Path) -> Result<VectorStore> {
    store.save(staging)?;
    let reloaded = VectorStore::load(staging)?;
    if reloaded.ntotal() != store.ntotal() {
        return Err(PipelineError::corrupt(
            staging,
            format!(
                "staged snapshot holds {} entries, expected {}",
                reloaded.ntotal(),
                store.ntotal()
            ),
        ));
    }
    Ok(reloaded)
}
