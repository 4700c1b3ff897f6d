use serde::{Deserialize, Serialize};

/// One validated event record, ready for chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub title: String,
    pub url: Option<String>,
    pub date_start: Option<String>,
    pub date_end: Option<String>,
    pub city: Option<String>,
    pub region: String,
    pub keywords: Vec<String>,
    pub text_to_embed: String,
}

/// Per-chunk copy of the parent record's descriptive fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub id: String,
    pub title: String,
    pub url: Option<String>,
    pub date_start: Option<String>,
    pub date_end: Option<String>,
    pub city: Option<String>,
    pub region: String,
    pub keywords: Vec<String>,
}

impl From<&EventRecord> for ChunkMetadata {
    fn from(record: &EventRecord) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            url: record.url.clone(),
            date_start: record.date_start.clone(),
            date_end: record.date_end.clone(),
            city: record.city.clone(),
            region: record.region.clone(),
            keywords: record.keywords.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventChunk {
    pub metadata: ChunkMetadata,
    /// Position of the chunk within its parent record.
    pub chunk_index: usize,
    pub page_content: String,
}

/// A chunk returned by retrieval, nearest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub page_content: String,
    pub metadata: ChunkMetadata,
    pub chunk_index: usize,
    /// Euclidean distance to the query; smaller is more similar.
    pub score: f32,
}

impl RetrievedChunk {
    pub fn from_chunk(chunk: &EventChunk, score: f32) -> Self {
        Self {
            page_content: chunk.page_content.clone(),
            metadata: chunk.metadata.clone(),
            chunk_index: chunk.chunk_index,
            score,
        }
    }
}
