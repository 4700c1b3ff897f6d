pub mod builder;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod ingest;
pub mod models;
pub mod providers;
pub mod retriever;
pub mod snapshot;
pub mod store;
pub mod traits;

pub use builder::{IndexBuilder, RebuildOutcome};
pub use chunking::{normalize_text, ChunkSpans, RecordChunks, TextChunker};
pub use config::{
    ChunkingConfig, EmbeddingConfig, PipelineConfig, PipelineConfigBuilder, RetrievalConfig,
};
pub use embeddings::{CharacterNgramBackend, EmbeddingClient, DEFAULT_NGRAM_DIMENSIONS};
pub use error::{PipelineError, Result};
pub use ingest::{load_documents, parse_documents, LoadReport, SkippedRecord};
pub use models::{ChunkMetadata, EventChunk, EventRecord, RetrievedChunk};
pub use providers::MistralBackend;
pub use retriever::Retriever;
pub use snapshot::{RebuildLock, SnapshotStore};
pub use store::{IndexHandle, SnapshotManifest, VectorStore};
pub use traits::{Embedder, EmbeddingBackend};
