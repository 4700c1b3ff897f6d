use crate::error::{PipelineError, Result};
use crate::models::{EventChunk, RetrievedChunk};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const INDEX_FILE: &str = "index.bin";
pub const METADATA_FILE: &str = "metadata.json";

const MAGIC: u32 = 0x5849_4741; // "AGIX"
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 20;

/// Exhaustive Euclidean index with chunk metadata kept in insertion order.
///
/// Row `i` of the vector matrix always belongs to `chunks[i]`.
#[derive(Debug, Clone, Default)]
pub struct VectorStore {
    dimension: usize,
    vectors: Vec<f32>,
    chunks: Vec<EventChunk>,
    model: String,
    built_at: Option<DateTime<Utc>>,
}

/// What `metadata.json` claims about a snapshot, read without touching `index.bin`.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotManifest {
    pub model: String,
    pub built_at: Option<DateTime<Utc>>,
    pub dimension: usize,
    pub ntotal: usize,
    /// Length of the metadata list itself.
    pub entries: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMetadata {
    format_version: u32,
    model: String,
    built_at: Option<DateTime<Utc>>,
    dimension: usize,
    ntotal: usize,
    index_sha256: String,
    chunks: Vec<EventChunk>,
}

impl VectorStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build(vectors: Vec<Vec<f32>>, chunks: Vec<EventChunk>) -> Result<Self> {
        if vectors.len() != chunks.len() {
            return Err(PipelineError::ShapeMismatch(format!(
                "{} vectors for {} metadata entries",
                vectors.len(),
                chunks.len()
            )));
        }

        let dimension = vectors.first().map(Vec::len).unwrap_or(0);
        if !vectors.is_empty() && dimension == 0 {
            return Err(PipelineError::ShapeMismatch(
                "vectors have zero dimensions".to_string(),
            ));
        }

        let mut flat = Vec::with_capacity(dimension * vectors.len());
        for (position, vector) in vectors.into_iter().enumerate() {
            if vector.len() != dimension {
                return Err(PipelineError::ShapeMismatch(format!(
                    "vector {position} has dimension {} but the index uses {dimension}",
                    vector.len()
                )));
            }
            flat.extend(vector);
        }

        Ok(Self {
            dimension,
            vectors: flat,
            chunks,
            model: String::new(),
            built_at: Some(Utc::now()),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Number of stored vectors.
    pub fn ntotal(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    pub fn chunks(&self) -> &[EventChunk] {
        &self.chunks
    }

    fn row(&self, position: usize) -> &[f32] {
        let start = position * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    /// Returns the `k` nearest chunks, nearest first. `k` above `ntotal` is clamped.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<RetrievedChunk>> {
        if k == 0 {
            return Err(PipelineError::InvalidArgument(
                "k must be at least 1".to_string(),
            ));
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(PipelineError::ShapeMismatch(format!(
                "query has dimension {} but the index uses {}",
                query.len(),
                self.dimension
            )));
        }

        let mut scored: Vec<(usize, f32)> = (0..self.ntotal())
            .map(|position| (position, euclidean(self.row(position), query)))
            .collect();

        let by_distance = |left: &(usize, f32), right: &(usize, f32)| -> Ordering {
            left.1.total_cmp(&right.1).then(left.0.cmp(&right.0))
        };
        let k = k.min(scored.len());
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, by_distance);
            scored.truncate(k);
        }
        scored.sort_by(by_distance);

        Ok(scored
            .into_iter()
            .map(|(position, distance)| RetrievedChunk::from_chunk(&self.chunks[position], distance))
            .collect())
    }

    /// Writes `index.bin` and `metadata.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;

        let encoded = self.encode_vectors()?;
        write_synced(&dir.join(INDEX_FILE), &encoded)?;

        let metadata = SnapshotMetadata {
            format_version: FORMAT_VERSION,
            model: self.model.clone(),
            built_at: self.built_at,
            dimension: self.dimension,
            ntotal: self.ntotal(),
            index_sha256: digest(&encoded),
            chunks: self.chunks.clone(),
        };
        write_synced(&dir.join(METADATA_FILE), &serde_json::to_vec(&metadata)?)?;
        Ok(())
    }

    /// Restores a snapshot, refusing it unless vectors and metadata line up.
    pub fn load(dir: &Path) -> Result<Self> {
        let index_path = dir.join(INDEX_FILE);
        let metadata_path = dir.join(METADATA_FILE);

        let encoded = read_artifact(&index_path)?;
        let (dimension, count, vectors) = decode_vectors(&encoded)
            .map_err(|details| PipelineError::corrupt(&index_path, details))?;

        let metadata = read_metadata(&metadata_path)?;

        if metadata.format_version != FORMAT_VERSION {
            return Err(PipelineError::corrupt(
                &metadata_path,
                format!("unsupported format version {}", metadata.format_version),
            ));
        }
        if metadata.index_sha256 != digest(&encoded) {
            return Err(PipelineError::corrupt(
                &index_path,
                "checksum does not match metadata",
            ));
        }
        if count != metadata.chunks.len() || metadata.ntotal != count {
            return Err(PipelineError::corrupt(
                dir,
                format!(
                    "index holds {count} vectors but metadata lists {} entries",
                    metadata.chunks.len()
                ),
            ));
        }
        if count > 0 && metadata.dimension != dimension {
            return Err(PipelineError::corrupt(
                dir,
                format!(
                    "index dimension {dimension} disagrees with metadata dimension {}",
                    metadata.dimension
                ),
            ));
        }

        Ok(Self {
            dimension,
            vectors,
            chunks: metadata.chunks,
            model: metadata.model,
            built_at: metadata.built_at,
        })
    }

    pub fn read_manifest(dir: &Path) -> Result<SnapshotManifest> {
        let metadata = read_metadata(&dir.join(METADATA_FILE))?;
        Ok(SnapshotManifest {
            model: metadata.model,
            built_at: metadata.built_at,
            dimension: metadata.dimension,
            ntotal: metadata.ntotal,
            entries: metadata.chunks.len(),
        })
    }

    fn encode_vectors(&self) -> Result<Vec<u8>> {
        let dimension = u32::try_from(self.dimension).map_err(|_| {
            PipelineError::ShapeMismatch(format!(
                "dimension {} does not fit the index header",
                self.dimension
            ))
        })?;

        let mut buffer = Vec::with_capacity(HEADER_LEN + self.vectors.len() * 4);
        buffer.extend_from_slice(&MAGIC.to_le_bytes());
        buffer.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buffer.extend_from_slice(&dimension.to_le_bytes());
        buffer.extend_from_slice(&(self.ntotal() as u64).to_le_bytes());
        for value in &self.vectors {
            buffer.extend_from_slice(&value.to_le_bytes());
        }
        Ok(buffer)
    }
}

/// A missing or unreadable artifact means the snapshot is incomplete.
fn read_artifact(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|error| PipelineError::corrupt(path, format!("unreadable: {error}")))
}

fn read_metadata(path: &Path) -> Result<SnapshotMetadata> {
    serde_json::from_slice(&read_artifact(path)?)
        .map_err(|error| PipelineError::corrupt(path, error.to_string()))
}

fn decode_vectors(bytes: &[u8]) -> std::result::Result<(usize, usize, Vec<f32>), String> {
    let read_u32 = |offset: usize| {
        bytes
            .get(offset..offset + 4)
            .and_then(|slice| slice.try_into().ok())
            .map(u32::from_le_bytes)
    };

    if bytes.len() < HEADER_LEN {
        return Err("file too short".to_string());
    }
    if read_u32(0) != Some(MAGIC) {
        return Err("invalid magic".to_string());
    }
    let version = read_u32(4).unwrap_or_default();
    if version != FORMAT_VERSION {
        return Err(format!("unsupported format version {version}"));
    }

    let dimension = read_u32(8).unwrap_or_default() as usize;
    let count = bytes
        .get(12..20)
        .and_then(|slice| slice.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or_default() as usize;

    let body = &bytes[HEADER_LEN..];
    let expected = dimension
        .checked_mul(count)
        .and_then(|values| values.checked_mul(4))
        .ok_or_else(|| "header sizes overflow".to_string())?;
    if body.len() != expected {
        return Err(format!(
            "expected {expected} bytes of vectors for {count}x{dimension}, found {}",
            body.len()
        ));
    }

    let vectors = body
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok((dimension, count, vectors))
}

fn euclidean(left: &[f32], right: &[f32]) -> f32 {
    left.iter()
        .zip(right)
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f32>()
        .sqrt()
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Process-wide handle to the served index.
///
/// Readers clone the current `Arc` under a short read lock and search without
/// holding it, so a `replace` never exposes a half-swapped store.
#[derive(Debug, Clone, Default)]
pub struct IndexHandle {
    current: Arc<RwLock<Arc<VectorStore>>>,
}

impl IndexHandle {
    pub fn new(store: VectorStore) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(store))),
        }
    }

    pub async fn snapshot(&self) -> Arc<VectorStore> {
        self.current.read().await.clone()
    }

    /// Swaps in a new store and returns the one it replaced.
    pub async fn replace(&self, store: VectorStore) -> Arc<VectorStore> {
        let mut current = self.current.write().await;
        std::mem::replace(&mut *current, Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn chunk(id: &str, chunk_index: usize) -> EventChunk {
        EventChunk {
            metadata: ChunkMetadata {
                id: id.to_string(),
                title: format!("Événement {id}"),
                url: Some(format!("https://openagenda.com/e/{id}")),
                date_start: Some("2025-04-01T10:00:00+02:00".to_string()),
                date_end: None,
                city: Some("Paris".to_string()),
                region: "Île-de-France".to_string(),
                keywords: vec!["culture".to_string()],
            },
            chunk_index,
            page_content: format!("{id} chunk {chunk_index}"),
        }
    }

    /// Three records split into 2, 3 and 1 chunks, embedded in 4 dimensions.
    fn six_chunk_store() -> Result<VectorStore> {
        let layout = [("a", 2), ("b", 3), ("c", 1)];
        let chunks: Vec<EventChunk> = layout
            .iter()
            .flat_map(|(id, count)| (0..*count).map(move |index| chunk(id, index)))
            .collect();
        let vectors = (0..chunks.len())
            .map(|position| vec![position as f32, 1.0, 0.5 * position as f32, -1.0])
            .collect();
        Ok(VectorStore::build(vectors, chunks)?.with_model("test-model"))
    }

    #[test]
    fn build_rejects_length_mismatch() {
        let result = VectorStore::build(vec![vec![1.0, 2.0]], vec![chunk("a", 0), chunk("a", 1)]);
        assert!(matches!(result, Err(PipelineError::ShapeMismatch(_))));
    }

    #[test]
    fn build_rejects_dimension_mismatch() {
        let result = VectorStore::build(
            vec![vec![1.0, 2.0], vec![1.0, 2.0, 3.0]],
            vec![chunk("a", 0), chunk("a", 1)],
        );
        assert!(matches!(result, Err(PipelineError::ShapeMismatch(_))));
    }

    #[test]
    fn search_is_nearest_first_and_clamped() -> Result<()> {
        let store = six_chunk_store()?;
        assert_eq!(store.ntotal(), 6);
        assert_eq!(store.dimension(), 4);

        let query = [2.0, 1.0, 1.0, -1.0];
        let top = store.search(&query, 5)?;
        assert_eq!(top.len(), 5);
        assert_eq!(top[0].metadata.id, "b");
        assert_eq!(top[0].chunk_index, 0);
        assert_eq!(top[0].score, 0.0);
        assert!(top.windows(2).all(|pair| pair[0].score <= pair[1].score));

        let all = store.search(&query, 10)?;
        assert_eq!(all.len(), 6);
        Ok(())
    }

    #[test]
    fn ties_keep_insertion_order() -> Result<()> {
        let store = VectorStore::build(
            vec![vec![1.0, 0.0], vec![-1.0, 0.0], vec![0.0, 1.0]],
            vec![chunk("x", 0), chunk("y", 0), chunk("z", 0)],
        )?;
        let hits = store.search(&[0.0, 0.0], 2)?;
        let ids: Vec<_> = hits.iter().map(|hit| hit.metadata.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y"]);
        Ok(())
    }

    #[test]
    fn search_validates_k_and_query_dimension() -> Result<()> {
        let store = six_chunk_store()?;
        assert!(matches!(
            store.search(&[0.0; 4], 0),
            Err(PipelineError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.search(&[0.0; 3], 1),
            Err(PipelineError::ShapeMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn empty_store_answers_with_no_hits() -> Result<()> {
        let store = VectorStore::build(Vec::new(), Vec::new())?;
        assert!(store.search(&[1.0, 2.0], 3)?.is_empty());
        Ok(())
    }

    #[test]
    fn reload_gives_identical_results() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = six_chunk_store()?;
        store.save(dir.path())?;

        let loaded = VectorStore::load(dir.path())?;
        assert_eq!(loaded.ntotal(), store.ntotal());
        assert_eq!(loaded.model(), "test-model");

        for query in [[0.3, 1.0, 0.2, -1.0], [5.0, -2.0, 1.5, 0.0]] {
            assert_eq!(loaded.search(&query, 4)?, store.search(&query, 4)?);
        }
        Ok(())
    }

    #[test]
    fn empty_store_round_trips() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        VectorStore::empty().save(dir.path())?;
        let loaded = VectorStore::load(dir.path())?;
        assert!(loaded.is_empty());
        Ok(())
    }

    #[test]
    fn metadata_count_drift_is_corrupt() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        six_chunk_store()?.save(dir.path())?;

        let metadata_path = dir.path().join(METADATA_FILE);
        let mut metadata: serde_json::Value = serde_json::from_slice(&fs::read(&metadata_path)?)?;
        metadata["chunks"]
            .as_array_mut()
            .ok_or("chunks should be an array")?
            .pop();
        fs::write(&metadata_path, serde_json::to_vec(&metadata)?)?;

        let result = VectorStore::load(dir.path());
        assert!(matches!(result, Err(PipelineError::CorruptIndex { .. })));
        Ok(())
    }

    #[test]
    fn tampered_vectors_are_corrupt() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        six_chunk_store()?.save(dir.path())?;

        let index_path = dir.path().join(INDEX_FILE);
        let mut bytes = fs::read(&index_path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&index_path, &bytes)?;
        assert!(matches!(
            VectorStore::load(dir.path()),
            Err(PipelineError::CorruptIndex { .. })
        ));

        bytes.truncate(HEADER_LEN + 3);
        fs::write(&index_path, &bytes)?;
        assert!(matches!(
            VectorStore::load(dir.path()),
            Err(PipelineError::CorruptIndex { .. })
        ));
        Ok(())
    }

    #[test]
    fn missing_artifact_is_corrupt() -> std::result::Result<(), Box<dyn std::error::Error>> {
        for artifact in [METADATA_FILE, INDEX_FILE] {
            let dir = tempdir()?;
            six_chunk_store()?.save(dir.path())?;
            fs::remove_file(dir.path().join(artifact))?;

            let result = VectorStore::load(dir.path());
            assert!(
                matches!(result, Err(PipelineError::CorruptIndex { .. })),
                "{artifact} removed: {result:?}"
            );
        }
        Ok(())
    }

    #[test]
    fn manifest_reports_metadata_without_the_index() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        six_chunk_store()?.save(dir.path())?;
        fs::remove_file(dir.path().join(INDEX_FILE))?;

        let manifest = VectorStore::read_manifest(dir.path())?;
        assert_eq!(manifest.model, "test-model");
        assert_eq!(manifest.dimension, 4);
        assert_eq!(manifest.ntotal, 6);
        assert_eq!(manifest.entries, 6);

        fs::remove_file(dir.path().join(METADATA_FILE))?;
        assert!(matches!(
            VectorStore::read_manifest(dir.path()),
            Err(PipelineError::CorruptIndex { .. })
        ));
        Ok(())
    }

    #[test]
    fn oversized_dimension_is_refused_on_save() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = VectorStore {
            dimension: u32::MAX as usize + 1,
            ..VectorStore::default()
        };
        assert!(matches!(
            store.save(dir.path()),
            Err(PipelineError::ShapeMismatch(_))
        ));
        assert!(!dir.path().join(INDEX_FILE).exists());
        Ok(())
    }

    #[tokio::test]
    async fn handle_swaps_whole_stores() -> Result<()> {
        let handle = IndexHandle::new(VectorStore::empty());
        let before = handle.snapshot().await;
        assert!(before.is_empty());

        let previous = handle.replace(six_chunk_store()?).await;
        assert!(previous.is_empty());
        assert!(before.is_empty());
        assert_eq!(handle.snapshot().await.ntotal(), 6);
        Ok(())
    }

    /// Vector sets and a query of one shared dimension, with coarse values so ties occur.
    fn arb_index() -> impl Strategy<Value = (Vec<Vec<f32>>, Vec<f32>)> {
        (1usize..6).prop_flat_map(|dimension| {
            let value = prop_oneof![(-4i8..4).prop_map(f32::from), -50.0f32..50.0];
            (
                proptest::collection::vec(proptest::collection::vec(value.clone(), dimension), 0..24),
                proptest::collection::vec(value, dimension),
            )
        })
    }

    fn positional_store(vectors: Vec<Vec<f32>>) -> Result<VectorStore> {
        let chunks = (0..vectors.len()).map(|position| chunk("p", position)).collect();
        VectorStore::build(vectors, chunks)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn search_matches_exhaustive_ranking((vectors, query) in arb_index(), k in 1usize..32) {
            let mut expected: Vec<(usize, f32)> = vectors
                .iter()
                .enumerate()
                .map(|(position, vector)| (position, euclidean(vector, &query)))
                .collect();
            expected.sort_by(|left, right| left.1.total_cmp(&right.1).then(left.0.cmp(&right.0)));
            expected.truncate(k);

            let store = positional_store(vectors.clone()).unwrap();
            let hits = store.search(&query, k).unwrap();

            prop_assert_eq!(hits.len(), k.min(vectors.len()));
            let positions: Vec<usize> = hits.iter().map(|hit| hit.chunk_index).collect();
            let expected_positions: Vec<usize> = expected.iter().map(|(position, _)| *position).collect();
            prop_assert_eq!(positions, expected_positions);
            prop_assert!(hits.windows(2).all(|pair| pair[0].score <= pair[1].score));
        }

        #[test]
        fn reloaded_store_answers_identically((vectors, query) in arb_index(), k in 1usize..32) {
            let dir = tempdir().unwrap();
            let store = positional_store(vectors).unwrap().with_model("prop-model");
            store.save(dir.path()).unwrap();
            let loaded = VectorStore::load(dir.path()).unwrap();

            prop_assert_eq!(loaded.ntotal(), store.ntotal());
            prop_assert_eq!(loaded.chunks(), store.chunks());
            prop_assert_eq!(loaded.search(&query, k).unwrap(), store.search(&query, k).unwrap());
        }
    }
}
