//! Retrieval strategies for context-pack chunk selection.
//!
//! [`RecencyRetriever`] streams every stored chunk through a bounded
//! min-heap keyed by effective quality, so at most `max_excerpts` chunks
//! are held in memory. [`ContextualRetriever`] pulls chunks around a failed
//! session or by episode type. Both feed the same two-phase deduplication.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::decay::decayed_quality;
use crate::core::models::{quality_score, Chunk};
use crate::error::Result;
use crate::graph::{EpisodeType, SessionGraph};
use crate::storage::{now_epoch, NdjsonStorage};

/// Default similarity ratio above which two chunks are near-duplicates.
/// Surfaced in config as `dedup.near_threshold`.
pub const NEAR_DEDUP_THRESHOLD: f64 = 0.70;

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\s+").unwrap()
});

/// Lowercases and collapses whitespace for exact-dedup hashing.
fn normalize_text(text: &str) -> String {
    WHITESPACE_RE
        .replace_all(&text.to_lowercase(), " ")
        .trim()
        .to_string()
}

/// Frequency-based upper bound on [`similarity_ratio`], cheap enough to
/// gate the quadratic pass.
fn quick_ratio_bound(a: &[char], b: &[char]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let mut counts: HashMap<char, i64> = HashMap::new();
    for &c in a {
        *counts.entry(c).or_insert(0) += 1;
    }
    let mut matches = 0i64;
    for &c in b {
        if let Some(count) = counts.get_mut(&c) {
            if *count > 0 {
                *count -= 1;
                matches += 1;
            }
        }
    }
    2.0 * matches as f64 / (a.len() + b.len()) as f64
}

/// Longest-common-subsequence similarity: `2 * lcs / (len_a + len_b)`.
#[must_use]
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    // Two-row DP over the shorter string.
    let (long, short) = if a.len() >= b.len() { (&a, &b) } else { (&b, &a) };
    let mut prev = vec![0usize; short.len() + 1];
    let mut row = vec![0usize; short.len() + 1];
    for &lc in long.iter() {
        for (j, &sc) in short.iter().enumerate() {
            row[j + 1] = if lc == sc {
                prev[j] + 1
            } else {
                prev[j + 1].max(row[j])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    let lcs = prev[short.len()];
    2.0 * lcs as f64 / (a.len() + b.len()) as f64
}

/// Removes exact and near-duplicate chunks.
///
/// Phase 1 (exact): hash by normalized text; keep the chunk with the higher
/// `(quality_score, ts_end)`. Phase 2 (near): pairwise similarity over the
/// survivors; above `near_threshold` the lower `(quality_score, ts_end)`
/// goes. Input order is preserved for survivors, making the pass
/// idempotent.
#[must_use]
pub fn deduplicate_chunks(chunks: Vec<Chunk>, near_threshold: f64) -> Vec<Chunk> {
    if chunks.len() <= 1 {
        return chunks;
    }

    // Phase 1: exact dedup on normalized text.
    let mut best_by_hash: HashMap<String, usize> = HashMap::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let key = normalize_text(&chunk.text);
        match best_by_hash.get(&key) {
            None => {
                best_by_hash.insert(key, i);
            }
            Some(&existing) => {
                let incoming = (chunk.quality_score, chunk.ts_end);
                let current = (chunks[existing].quality_score, chunks[existing].ts_end);
                if incoming > current {
                    best_by_hash.insert(key, i);
                }
            }
        }
    }
    let survivors: std::collections::HashSet<usize> = best_by_hash.into_values().collect();
    let deduped: Vec<usize> = (0..chunks.len()).filter(|i| survivors.contains(i)).collect();

    // Phase 2: near dedup over the survivors.
    let texts: Vec<Vec<char>> = deduped
        .iter()
        .map(|&i| chunks[i].text.chars().collect())
        .collect();
    let mut removed = vec![false; deduped.len()];
    for i in 0..deduped.len() {
        if removed[i] {
            continue;
        }
        for j in (i + 1)..deduped.len() {
            if removed[j] {
                continue;
            }
            if quick_ratio_bound(&texts[i], &texts[j]) <= near_threshold {
                continue;
            }
            let ratio = similarity_ratio(&chunks[deduped[i]].text, &chunks[deduped[j]].text);
            if ratio > near_threshold {
                let a = &chunks[deduped[i]];
                let b = &chunks[deduped[j]];
                if (b.quality_score, b.ts_end) > (a.quality_score, a.ts_end) {
                    removed[i] = true;
                    break;
                }
                removed[j] = true;
            }
        }
    }

    let mut result = Vec::new();
    let mut kept = vec![false; chunks.len()];
    for (pos, &i) in deduped.iter().enumerate() {
        if !removed[pos] {
            kept[i] = true;
        }
    }
    for (i, chunk) in chunks.into_iter().enumerate() {
        if kept[i] {
            result.push(chunk);
        }
    }
    result
}

/// A chunk retrieval strategy.
pub trait Retriever {
    /// Returns an ordered chunk list for pack assembly.
    fn retrieve(&self, storage: &NdjsonStorage) -> Result<Vec<Chunk>>;
}

/// Heap key ordered by `(effective_quality, ts_end, counter)`.
#[derive(Debug)]
struct HeapItem {
    q_eff: f64,
    ts_end: f64,
    counter: usize,
    chunk: Chunk,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.counter == other.counter
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.q_eff
            .partial_cmp(&other.q_eff)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                self.ts_end
                    .partial_cmp(&other.ts_end)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(self.counter.cmp(&other.counter))
    }
}

/// Selects the most recent high-quality chunks.
///
/// With `half_life_days > 0`, conversation (non-artifact) chunks have their
/// quality decayed exponentially before the quality threshold applies;
/// artifact chunks always use their stored quality.
#[derive(Debug, Clone)]
pub struct RecencyRetriever {
    /// Minimum effective quality.
    pub min_quality: f64,
    /// Minimum stripped text length in chars.
    pub min_length: usize,
    /// Heap bound.
    pub max_excerpts: usize,
    /// Decay half-life; 0 disables decay.
    pub half_life_days: f64,
    /// Near-dup similarity threshold.
    pub near_threshold: f64,
}

impl Default for RecencyRetriever {
    fn default() -> Self {
        Self {
            min_quality: 0.30,
            min_length: 30,
            max_excerpts: 200,
            half_life_days: 0.0,
            near_threshold: NEAR_DEDUP_THRESHOLD,
        }
    }
}

impl RecencyRetriever {
    /// Default thresholds with the given decay half-life.
    #[must_use]
    pub fn with_half_life(half_life_days: f64) -> Self {
        Self {
            half_life_days,
            ..Self::default()
        }
    }
}

impl Retriever for RecencyRetriever {
    fn retrieve(&self, storage: &NdjsonStorage) -> Result<Vec<Chunk>> {
        let now = now_epoch();
        let mut heap: BinaryHeap<Reverse<HeapItem>> = BinaryHeap::new();
        let mut counter = 0usize;

        for chunk in storage.all_chunks() {
            if chunk.text.trim().chars().count() < self.min_length {
                continue;
            }
            let q = if chunk.quality_score > 0.0 {
                chunk.quality_score
            } else {
                quality_score(&chunk.text)
            };

            let q_eff = if self.half_life_days > 0.0 && !chunk.is_artifact() {
                decayed_quality(q, chunk.ts_end, self.half_life_days, now)
            } else {
                q
            };
            if q_eff < self.min_quality {
                continue;
            }

            let item = HeapItem {
                q_eff,
                ts_end: chunk.ts_end,
                counter,
                chunk,
            };
            if heap.len() < self.max_excerpts {
                heap.push(Reverse(item));
            } else {
                let replaces_min = heap
                    .peek()
                    .is_some_and(|min| (item.q_eff, item.ts_end) > (min.0.q_eff, min.0.ts_end));
                if replaces_min {
                    heap.pop();
                    heap.push(Reverse(item));
                }
            }
            counter += 1;
        }

        let mut result: Vec<Chunk> = heap.into_iter().map(|r| r.0.chunk).collect();
        result.sort_by(|a, b| {
            b.ts_end
                .partial_cmp(&a.ts_end)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(deduplicate_chunks(result, self.near_threshold))
    }
}

/// Episode-aware and failure-aware retrieval.
#[derive(Debug, Clone)]
pub struct ContextualRetriever {
    /// Result cap.
    pub max_chunks: usize,
}

impl Default for ContextualRetriever {
    fn default() -> Self {
        Self { max_chunks: 200 }
    }
}

impl ContextualRetriever {
    /// Chunks from `session_id` and its temporal neighbors, newest first.
    pub fn retrieve_around_failure(
        &self,
        storage: &NdjsonStorage,
        session_id: &str,
    ) -> Result<Vec<Chunk>> {
        if storage.read_meta(session_id).is_none() {
            return Ok(Vec::new());
        }

        let all_metas = storage.list_sessions();
        let graph = SessionGraph::new();
        let related = graph.find_related_sessions(session_id, &all_metas);

        let mut target_ids: Vec<&str> = vec![session_id];
        target_ids.extend(related.iter().map(String::as_str));

        let mut chunks = Vec::new();
        for sid in target_ids {
            chunks.extend(storage.read_chunks(sid)?);
        }

        chunks.sort_by(|a, b| {
            b.ts_end
                .partial_cmp(&a.ts_end)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        chunks.truncate(self.max_chunks);
        Ok(chunks)
    }

    /// Chunks from all sessions classified as `episode_type`, newest first.
    pub fn retrieve_by_episode(
        &self,
        storage: &NdjsonStorage,
        episode_type: EpisodeType,
    ) -> Result<Vec<Chunk>> {
        let graph = SessionGraph::new();
        let all_metas = storage.list_sessions();

        let mut chunks = Vec::new();
        for meta in &all_metas {
            let session_chunks = storage.read_chunks(&meta.session_id)?;
            if graph.classify_episode(meta, &session_chunks) == episode_type {
                chunks.extend(session_chunks);
            }
        }

        chunks.sort_by(|a, b| {
            b.ts_end
                .partial_cmp(&a.ts_end)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        chunks.truncate(self.max_chunks);
        Ok(chunks)
    }
}
