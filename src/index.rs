//! Append-only embedding index: `vectors.bin` + `metadata.jsonl`.
//!
//! `vectors.bin` holds raw little-endian f32 rows of a fixed dimension;
//! `metadata.jsonl` holds one JSON object per row in the same order. Rows
//! are only ever appended; the single mutation is a full clear-and-rebuild
//! when any chunk file is newer than the index. A truncating reader
//! re-establishes alignment as `min(vector_rows, metadata_lines)`.

use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::chunker::{char_count, char_prefix};
use crate::core::decay::decay_factor;
use crate::core::models::{Chunk, SearchResult};
use crate::error::Result;
use crate::ollama::OllamaClient;
use crate::storage::{file_mtime_epoch, now_epoch, NdjsonStorage};

/// Default embedding dimension (nomic-embed-text).
pub const DEFAULT_DIM: usize = 768;

/// Stored text is truncated to roughly this many chars.
const METADATA_TEXT_LIMIT: usize = 500;

/// Bounded boost multiplier for brand-new content: `1 + ALPHA * decay`.
const DECAY_BOOST_ALPHA: f64 = 0.10;

/// Chunks per embedding request during index builds.
const EMBED_BATCH_SIZE: usize = 10;

/// One metadata row, aligned with its vector row by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IndexEntry {
    /// Source chunk id.
    #[serde(default)]
    pub chunk_id: String,
    /// Owning session (or synthetic artifact session).
    #[serde(default)]
    pub session_id: String,
    /// Chunk text truncated for storage.
    #[serde(default)]
    pub text: String,
    /// Chunk start time.
    #[serde(default)]
    pub ts_start: f64,
    /// Chunk end time.
    #[serde(default)]
    pub ts_end: f64,
    /// Artifact tag; absent for session chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Stored quality score, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}

impl IndexEntry {
    /// Builds the stored row for a chunk, truncating its text.
    #[must_use]
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            session_id: chunk.session_id.clone(),
            text: char_prefix(&chunk.text, METADATA_TEXT_LIMIT),
            ts_start: chunk.ts_start,
            ts_end: chunk.ts_end,
            artifact_type: chunk.artifact_type().map(ToString::to_string),
            quality_score: Some(chunk.quality_score),
        }
    }
}

/// Search parameters.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Number of results.
    pub top_k: usize,
    /// Decay half-life in days; 0 disables the boost.
    pub half_life_days: f64,
    /// Explicit per-query decay opt-out.
    pub no_decay: bool,
    /// Filter: `"session"` selects rows without an artifact tag; any other
    /// value matches the tag exactly.
    pub artifact_type: Option<String>,
}

/// Append-only vector index over a directory.
#[derive(Debug)]
pub struct VectorIndex {
    vectors_path: PathBuf,
    metadata_path: PathBuf,
}

impl VectorIndex {
    /// Opens (without creating) the index in `index_dir`.
    #[must_use]
    pub fn new(index_dir: &Path) -> Self {
        Self {
            vectors_path: index_dir.join("vectors.bin"),
            metadata_path: index_dir.join("metadata.jsonl"),
        }
    }

    /// Path of the metadata sidecar (used for staleness comparison).
    #[must_use]
    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    /// Normalizes (L2) and appends a vector with its metadata. A zero-norm
    /// vector is stored as-is.
    pub fn add(&self, vector: &[f32], entry: &IndexEntry) -> Result<()> {
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        let mut bytes = Vec::with_capacity(vector.len() * 4);
        for &v in vector {
            let value = if norm > 0.0 { v / norm } else { v };
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        let mut vectors = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.vectors_path)?;
        vectors.write_all(&bytes)?;

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut metadata = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.metadata_path)?;
        metadata.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Removes all index data, forcing the next build to start fresh.
    pub fn clear(&self) -> Result<()> {
        for path in [&self.vectors_path, &self.metadata_path] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Session ids already present in the metadata sidecar.
    pub fn indexed_sessions(&self) -> Result<HashSet<String>> {
        Ok(self
            .load_all_metadata()?
            .into_iter()
            .map(|e| e.session_id)
            .collect())
    }

    /// Cosine search over the memory-mapped vector file.
    ///
    /// Scores are plain dot products of normalized vectors, in `[-1, 1]`.
    /// With decay enabled, session rows get a bounded freshness boost of at
    /// most 10%; artifact rows are never boosted. The artifact filter walks
    /// progressively further down the ranking until `top_k` matching rows
    /// are found or the index is exhausted.
    pub fn search(&self, query: &[f32], options: &SearchOptions) -> Result<Vec<SearchResult>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let dim = query.len();
        let row_bytes = dim * 4;

        let Ok(file_meta) = fs::metadata(&self.vectors_path) else {
            return Ok(Vec::new());
        };
        if file_meta.len() == 0 {
            return Ok(Vec::new());
        }

        let mut n_vectors = (file_meta.len() as usize) / row_bytes;
        let n_metadata = self.count_metadata_lines()?;
        if n_metadata != n_vectors {
            tracing::warn!(
                vectors = n_vectors,
                metadata = n_metadata,
                "index integrity mismatch; truncating to the smaller count"
            );
            n_vectors = n_vectors.min(n_metadata);
        }
        if n_vectors == 0 {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&self.vectors_path)?;
        // The index is append-only and single-writer by design; mapping a
        // file that only grows at the tail is safe for the rows we read.
        let mmap = unsafe { Mmap::map(&file)? };

        let norm: f32 = query.iter().map(|v| v * v).sum::<f32>().sqrt();
        let query: Vec<f32> = if norm > 0.0 {
            query.iter().map(|v| v / norm).collect()
        } else {
            query.to_vec()
        };

        // One linear pass; rows score independently.
        let mut scores: Vec<f64> = (0..n_vectors)
            .into_par_iter()
            .map(|row| {
                let offset = row * row_bytes;
                let bytes = &mmap[offset..offset + row_bytes];
                let mut dot = 0.0f32;
                for (chunk, q) in bytes.chunks_exact(4).zip(query.iter()) {
                    let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    dot += value * q;
                }
                f64::from(dot)
            })
            .collect();

        let needs_metadata_upfront =
            (options.half_life_days > 0.0 && !options.no_decay) || options.artifact_type.is_some();
        let all_metadata = if needs_metadata_upfront {
            Some(self.load_all_metadata()?)
        } else {
            None
        };

        if options.half_life_days > 0.0 && !options.no_decay {
            if let Some(metadata) = &all_metadata {
                let now = now_epoch();
                for (row, score) in scores.iter_mut().enumerate().take(metadata.len()) {
                    let entry = &metadata[row];
                    if entry.artifact_type.is_none() {
                        let boost = 1.0
                            + DECAY_BOOST_ALPHA
                                * decay_factor(entry.ts_end, options.half_life_days, now);
                        *score *= boost;
                    }
                }
            }
        }

        let mut order: Vec<usize> = (0..n_vectors).collect();
        order.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let selected: Vec<usize> = match (&options.artifact_type, &all_metadata) {
            (Some(filter), Some(metadata)) => order
                .into_iter()
                .filter(|&row| {
                    let tag = metadata.get(row).and_then(|e| e.artifact_type.as_deref());
                    if filter == "session" {
                        tag.is_none()
                    } else {
                        tag == Some(filter.as_str())
                    }
                })
                .take(options.top_k)
                .collect(),
            _ => order.into_iter().take(options.top_k).collect(),
        };

        let results = match all_metadata {
            Some(metadata) => selected
                .into_iter()
                .filter_map(|row| {
                    metadata
                        .get(row)
                        .map(|entry| to_result(entry, scores[row]))
                })
                .collect(),
            None => {
                let wanted: HashSet<usize> = selected.iter().copied().collect();
                let loaded = self.load_metadata_at(&wanted)?;
                selected
                    .into_iter()
                    .filter_map(|row| loaded.get(&row).map(|entry| to_result(entry, scores[row])))
                    .collect()
            }
        };
        Ok(results)
    }

    fn count_metadata_lines(&self) -> Result<usize> {
        if !self.metadata_path.exists() {
            return Ok(0);
        }
        let mut count = 0;
        for line in BufReader::new(fs::File::open(&self.metadata_path)?).lines() {
            if !line?.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Loads metadata only for the requested row indices, exiting the pass
    /// early once everything requested has been seen.
    fn load_metadata_at(
        &self,
        indices: &HashSet<usize>,
    ) -> Result<std::collections::HashMap<usize, IndexEntry>> {
        let mut result = std::collections::HashMap::new();
        if !self.metadata_path.exists() || indices.is_empty() {
            return Ok(result);
        }
        let mut row = 0usize;
        for line in BufReader::new(fs::File::open(&self.metadata_path)?).lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if indices.contains(&row) {
                if let Ok(entry) = serde_json::from_str::<IndexEntry>(trimmed) {
                    result.insert(row, entry);
                }
                if result.len() == indices.len() {
                    break;
                }
            }
            row += 1;
        }
        Ok(result)
    }

    fn load_all_metadata(&self) -> Result<Vec<IndexEntry>> {
        if !self.metadata_path.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for line in BufReader::new(fs::File::open(&self.metadata_path)?).lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<IndexEntry>(trimmed) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

fn to_result(entry: &IndexEntry, score: f64) -> SearchResult {
    SearchResult {
        chunk_id: entry.chunk_id.clone(),
        session_id: entry.session_id.clone(),
        index: 0,
        text: entry.text.clone(),
        ts_start: entry.ts_start,
        ts_end: entry.ts_end,
        token_estimate: char_count(&entry.text) / 4,
        quality_score: entry.quality_score.unwrap_or(0.0),
        score,
        artifact_type: entry.artifact_type.clone(),
    }
}

/// True when any chunk file is newer than the index's metadata sidecar.
#[must_use]
pub fn index_is_stale(index: &VectorIndex, storage: &NdjsonStorage) -> bool {
    if !index.metadata_path().exists() {
        // No index yet: nothing stale, the build starts fresh.
        return false;
    }
    let index_mtime = file_mtime_epoch(index.metadata_path());
    let session_stale = storage.session_dirs_sorted().iter().any(|dir| {
        let chunks = dir.join("chunks.jsonl");
        chunks.exists() && file_mtime_epoch(&chunks) > index_mtime
    });
    if session_stale {
        return true;
    }
    let artifact_chunks = storage.artifacts_dir().join("chunks.jsonl");
    artifact_chunks.exists() && file_mtime_epoch(&artifact_chunks) > index_mtime
}

/// Builds or incrementally updates the index: chunks every session, clears
/// the index when stale, then embeds chunks of sessions not yet indexed in
/// batches, appending as it goes.
pub fn build_index(storage: &NdjsonStorage, client: &OllamaClient) -> Result<VectorIndex> {
    let index_dir = storage.index_dir();
    fs::create_dir_all(&index_dir)?;
    let index = VectorIndex::new(&index_dir);

    let config = storage.read_config()?;
    crate::chunker::chunk_all_sessions(storage, &config.chunking, false)?;

    if index_is_stale(&index, storage) {
        index.clear()?;
    }

    let already_indexed = index.indexed_sessions()?;

    // Session chunks first, then artifact chunks; each group is keyed by
    // its (possibly synthetic) session id for incremental skip.
    let mut groups: Vec<(String, Vec<Chunk>)> = Vec::new();
    for dir in storage.session_dirs_sorted() {
        let Some(session_id) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let chunks = storage.read_chunks(&session_id)?;
        if !chunks.is_empty() {
            groups.push((session_id, chunks));
        }
    }
    let artifact_chunks = storage.read_artifact_chunks();
    if !artifact_chunks.is_empty() {
        let mut by_session: std::collections::BTreeMap<String, Vec<Chunk>> =
            std::collections::BTreeMap::new();
        for chunk in artifact_chunks {
            by_session.entry(chunk.session_id.clone()).or_default().push(chunk);
        }
        groups.extend(by_session);
    }

    for (session_id, chunks) in groups {
        if already_indexed.contains(&session_id) {
            continue;
        }
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = client.embed(&texts)?;
            for (chunk, vector) in batch.iter().zip(vectors.iter()) {
                index.add(vector, &IndexEntry::from_chunk(chunk))?;
            }
        }
    }

    Ok(index)
}
