//! Deterministic text chunker for session events.
//!
//! Claude Code sessions delegate to the transcript adapter, which reads the
//! external CLI's structured JSONL for much higher-quality chunks. All other
//! sessions aggregate stdout events ordered by timestamp and segment at
//! double-newline boundaries or the configured token limit. Same input,
//! same chunks.

use crate::core::models::{quality_score, token_estimate, Chunk, Event};
use crate::error::Result;
use crate::sanitizer::strip_terminal_noise;
use crate::storage::{ChunkingConfig, NdjsonStorage};
use crate::transcript;

/// Counts Unicode scalar values. All chunker limits are in codepoints, not
/// bytes, so multibyte output cannot split inside a character.
#[must_use]
pub fn char_count(text: &str) -> usize {
    text.chars().count()
}

/// First `n` chars of `text`.
#[must_use]
pub fn char_prefix(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

/// Last `n` chars of `text` (the whole text when shorter).
#[must_use]
pub fn char_suffix(text: &str, n: usize) -> String {
    let total = char_count(text);
    if total <= n {
        return text.to_string();
    }
    text.chars().skip(total - n).collect()
}

/// A contiguous stretch of event text between split points.
#[derive(Debug, Clone)]
struct Segment {
    text: String,
    ts_start: f64,
    ts_end: f64,
}

/// Chunks one session, writing `chunks.jsonl` and returning the chunks.
///
/// Claude Code sessions go through the transcript adapter; everything else
/// uses terminal chunking over `events.jsonl`.
pub fn chunk_session(
    storage: &NdjsonStorage,
    session_id: &str,
    chunking: &ChunkingConfig,
) -> Result<Vec<Chunk>> {
    if let Some(meta) = storage.read_meta(session_id) {
        if transcript::is_claude_session(&meta) {
            if let Some(chunks) = chunk_claude_session(storage, &meta, chunking)? {
                return Ok(chunks);
            }
        }
    }

    let events = storage.read_events(session_id)?;
    let chunks = chunk_terminal_events(&events, session_id, chunking);
    storage.write_chunks(session_id, &chunks)?;
    Ok(chunks)
}

/// Ensures every session has a `chunks.jsonl`. Pass `force` to re-chunk
/// sessions that already have one (hook-grown transcripts).
pub fn chunk_all_sessions(
    storage: &NdjsonStorage,
    chunking: &ChunkingConfig,
    force: bool,
) -> Result<()> {
    for dir in storage.session_dirs_sorted() {
        let Some(session_id) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if storage.has_chunks(&session_id) && !force {
            continue;
        }
        chunk_session(storage, &session_id, chunking)?;
    }
    Ok(())
}

/// Locates and chunks the structured transcript behind a Claude session.
/// Returns `Ok(None)` when no transcript can be found or it yields nothing,
/// letting the caller fall back to terminal chunking.
fn chunk_claude_session(
    storage: &NdjsonStorage,
    meta: &crate::core::models::SessionMeta,
    chunking: &ChunkingConfig,
) -> Result<Option<Vec<Chunk>>> {
    let Some(session_file) =
        transcript::find_claude_session_file(&meta.cwd, meta.started_at, meta.ended_at)
    else {
        return Ok(None);
    };

    let turns = transcript::extract_turns(&session_file);
    if turns.is_empty() {
        return Ok(None);
    }

    let chunks = transcript::chunks_from_turns(&turns, &meta.session_id, chunking);
    if chunks.is_empty() {
        return Ok(None);
    }
    storage.write_chunks(&meta.session_id, &chunks)?;
    Ok(Some(chunks))
}

/// Terminal chunking: stdout events sorted by ts, noise-stripped, segmented,
/// assembled with a suffix overlap between consecutive chunks.
#[must_use]
pub fn chunk_terminal_events(
    events: &[Event],
    session_id: &str,
    chunking: &ChunkingConfig,
) -> Vec<Chunk> {
    let mut stdout_events: Vec<(f64, String)> = events
        .iter()
        .filter(|e| e.stream == "stdout")
        .map(|e| (e.ts, strip_terminal_noise(&e.content)))
        .collect();
    stdout_events.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    if stdout_events.is_empty() {
        return Vec::new();
    }

    let max_chars = chunking.max_tokens * 4;
    let overlap_chars = chunking.overlap_tokens * 4;
    let segments = segment_events(&stdout_events, max_chars);

    let mut chunks = Vec::with_capacity(segments.len());
    let mut overlap_text = String::new();

    for (idx, seg) in segments.iter().enumerate() {
        let assembled = if overlap_text.is_empty() {
            seg.text.clone()
        } else {
            format!("{overlap_text}{}", seg.text)
        };
        // Second noise pass: UI patterns may span event boundaries.
        let text = strip_terminal_noise(&assembled);

        chunks.push(Chunk {
            chunk_id: format!("{session_id}-{idx}"),
            session_id: session_id.to_string(),
            index: idx,
            token_estimate: token_estimate(&text),
            quality_score: quality_score(&text),
            text,
            ts_start: seg.ts_start,
            ts_end: seg.ts_end,
            extra: std::collections::BTreeMap::new(),
        });

        overlap_text = char_suffix(&seg.text, overlap_chars);
    }

    chunks
}

/// Segments events at double-newline boundaries, force-splitting whenever
/// the accumulator exceeds `max_chars`.
fn segment_events(events: &[(f64, String)], max_chars: usize) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current_text = String::new();
    let mut current_ts_start: Option<f64> = None;
    let mut current_ts_end = 0.0;

    for (ts, content) in events {
        let ts = *ts;
        if current_ts_start.is_none() {
            current_ts_start = Some(ts);
        }
        current_ts_end = ts;

        let parts: Vec<&str> = content.split("\n\n").collect();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                // A \n\n boundary: flush the current segment if non-blank.
                if !current_text.trim().is_empty() {
                    segments.push(Segment {
                        text: current_text.clone(),
                        ts_start: current_ts_start.unwrap_or(ts),
                        ts_end: current_ts_end,
                    });
                }
                current_text.clear();
                current_ts_start = Some(ts);
            }

            current_text.push_str(part);
            if i < parts.len() - 1 {
                current_text.push_str("\n\n");
            }

            while char_count(&current_text) > max_chars {
                let split_text = char_prefix(&current_text, max_chars);
                let rest: String = current_text.chars().skip(max_chars).collect();
                segments.push(Segment {
                    text: split_text,
                    ts_start: current_ts_start.unwrap_or(ts),
                    ts_end: ts,
                });
                current_text = rest;
                current_ts_start = Some(ts);
            }
        }
    }

    if !current_text.trim().is_empty() {
        segments.push(Segment {
            text: current_text,
            ts_start: current_ts_start.unwrap_or(0.0),
            ts_end: current_ts_end,
        });
    }

    segments
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn event(ts: f64, stream: &str, content: &str) -> Event {
        Event {
            event_id: String::new(),
            ts,
            session_id: "s1".into(),
            stream: stream.into(),
            role: "terminal".into(),
            content: content.into(),
        }
    }

    fn cfg() -> ChunkingConfig {
        ChunkingConfig::default()
    }

    #[test]
    fn test_empty_events_empty_chunks() {
        assert!(chunk_terminal_events(&[], "s1", &cfg()).is_empty());
    }

    #[test]
    fn test_only_stdout_events_used() {
        let events = vec![
            event(0.1, "stdin", "typed input"),
            event(0.2, "stdout", "visible output"),
            event(0.3, "system", "session_start"),
        ];
        let chunks = chunk_terminal_events(&events, "s1", &cfg());
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("visible output"));
        assert!(!chunks[0].text.contains("typed input"));
    }

    #[test]
    fn test_double_newline_splits() {
        let events = vec![event(0.1, "stdout", "first part\n\nsecond part")];
        let chunks = chunk_terminal_events(&events, "s1", &cfg());
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.contains("first part"));
        assert!(chunks[1].text.contains("second part"));
    }

    #[test]
    fn test_chunk_ids_and_indices_monotone() {
        let events = vec![event(0.1, "stdout", "a\n\nb\n\nc")];
        let chunks = chunk_terminal_events(&events, "s1", &cfg());
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.chunk_id, format!("s1-{i}"));
            assert!(chunk.ts_end >= chunk.ts_start);
        }
    }

    #[test]
    fn test_huge_message_force_splits() {
        let big = "a".repeat(5000);
        let events = vec![event(0.1, "stdout", &big)];
        let chunks = chunk_terminal_events(&events, "s1", &cfg());
        assert!(chunks.len() >= 2);
        // 512 tokens * 4 chars = 2048 max chars, plus overlap on later chunks.
        assert!(char_count(&chunks[0].text) <= 2048);
    }

    #[test]
    fn test_overlap_carried_between_chunks() {
        let chunking = ChunkingConfig {
            max_tokens: 25, // 100 chars
            overlap_tokens: 5, // 20 chars
        };
        let events = vec![event(0.1, "stdout", &"m".repeat(250))];
        let chunks = chunk_terminal_events(&events, "s1", &chunking);
        assert!(chunks.len() >= 2);
        // Later chunks carry the 20-char tail of the previous segment.
        assert_eq!(char_count(&chunks[1].text), 120);
    }

    #[test]
    fn test_events_sorted_by_ts() {
        let events = vec![
            event(5.0, "stdout", "later\n\n"),
            event(1.0, "stdout", "earlier\n\n"),
        ];
        let chunks = chunk_terminal_events(&events, "s1", &cfg());
        assert!(chunks[0].text.contains("earlier"));
        assert!(chunks[1].text.contains("later"));
    }

    #[test]
    fn test_noise_stripped_before_chunking() {
        let events = vec![event(0.1, "stdout", "─────\nreal content here\n─────")];
        let chunks = chunk_terminal_events(&events, "s1", &cfg());
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].text.contains('─'));
        assert!(chunks[0].text.contains("real content here"));
    }

    #[test]
    fn test_quality_and_token_estimate_populated() {
        let events = vec![event(0.2, "stdout", "alphanumeric text 12345")];
        let chunks = chunk_terminal_events(&events, "s1", &cfg());
        assert!(chunks[0].quality_score > 0.0 && chunks[0].quality_score <= 1.0);
        assert_eq!(chunks[0].token_estimate, char_count(&chunks[0].text) / 4);
    }

    #[test]
    fn test_deterministic() {
        let events = vec![
            event(0.1, "stdout", "alpha\n\nbeta"),
            event(0.2, "stdout", "gamma"),
        ];
        let a = chunk_terminal_events(&events, "s1", &cfg());
        let b = chunk_terminal_events(&events, "s1", &cfg());
        assert_eq!(a, b);
    }

    #[test]
    fn test_char_suffix_multibyte_safe() {
        assert_eq!(char_suffix("héllo", 3), "llo");
        assert_eq!(char_suffix("日本語テキスト", 2), "スト");
        assert_eq!(char_suffix("ab", 10), "ab");
    }

    #[test]
    fn test_whitespace_only_yields_no_chunks() {
        let events = vec![event(0.1, "stdout", "   \n\n   ")];
        assert!(chunk_terminal_events(&events, "s1", &cfg()).is_empty());
    }
}
