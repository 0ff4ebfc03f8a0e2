//! Project state generation via LLM summarization.
//!
//! Samples cleaned chunks across the whole history (always the first and
//! last, then the highest-quality remainder up to a character budget),
//! sends them to the chat model with deterministic settings, and persists
//! the structured snapshot. The snapshot is regenerated whenever any chunk
//! file is newer than `state.json`.

use serde_json::Value;

use crate::chunker::char_count;
use crate::core::models::{Decision, ProjectState, StateTask};
use crate::error::Result;
use crate::ollama::OllamaClient;
use crate::storage::{now_epoch, NdjsonStorage};

const SYSTEM_PROMPT: &str = "You are a project analyst. Given a transcript of developer sessions with an LLM assistant, \
produce a structured JSON summary with these exact fields:\n\
- \"summary\": A 2-3 sentence overview of the project and its current state.\n\
- \"decisions\": A list of key decisions, each with \"id\" (D1, D2, ...), \"statement\", and \"rationale\".\n\
- \"constraints\": A list of identified constraints (strings).\n\
- \"tasks\": A list of active tasks, each with \"id\" (T1, T2, ...) and \"status\" (one of: pending, in_progress, done).\n\
\n\
Output ONLY valid JSON, no markdown, no explanations.";

/// Character budget for the sampled transcript sent to the model.
const SAMPLE_CHAR_BUDGET: usize = 8000;

/// Samples chunk texts for summarization: the first and last chunks always
/// participate; remaining slots fill greedily by quality until the budget
/// is reached. Output is chronological, joined by blank lines.
#[must_use]
pub fn sample_chunk_texts(texts_with_quality: &[(String, f64)], char_budget: usize) -> String {
    if texts_with_quality.is_empty() {
        return String::new();
    }

    let n = texts_with_quality.len();
    let mut selected = vec![false; n];
    let mut used = 0usize;

    // Anchors: the beginning and the end of history.
    for &i in &[0, n - 1] {
        if !selected[i] {
            selected[i] = true;
            used += char_count(&texts_with_quality[i].0);
        }
    }

    let mut by_quality: Vec<usize> = (0..n).filter(|&i| !selected[i]).collect();
    by_quality.sort_by(|&a, &b| {
        texts_with_quality[b]
            .1
            .partial_cmp(&texts_with_quality[a].1)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    for i in by_quality {
        let len = char_count(&texts_with_quality[i].0);
        if used + len > char_budget {
            continue;
        }
        selected[i] = true;
        used += len;
    }

    let parts: Vec<&str> = (0..n)
        .filter(|&i| selected[i])
        .map(|i| texts_with_quality[i].0.as_str())
        .collect();
    parts.join("\n\n")
}

/// Lenient extraction of [`ProjectState`] fields from the model's JSON.
/// A non-object response is coerced to a bare summary.
#[must_use]
pub fn coerce_state(value: &Value) -> ProjectState {
    let Some(obj) = value.as_object() else {
        return ProjectState {
            summary: value_to_summary(value),
            ..ProjectState::default()
        };
    };

    let summary = obj
        .get("summary")
        .map(value_to_summary)
        .unwrap_or_default();

    let decisions = obj
        .get("decisions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| Decision::deserialize_lenient(item))
                .collect()
        })
        .unwrap_or_default();

    let constraints = obj
        .get("constraints")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(value_to_summary).collect())
        .unwrap_or_default();

    let tasks = obj
        .get("tasks")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| StateTask::deserialize_lenient(item))
                .collect()
        })
        .unwrap_or_default();

    ProjectState {
        summary,
        decisions,
        constraints,
        tasks,
        updated_at: 0.0,
        source_sessions: Vec::new(),
    }
}

fn value_to_summary(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Decision {
    fn deserialize_lenient(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            id: obj.get("id").map(value_to_summary).unwrap_or_default(),
            statement: obj.get("statement").map(value_to_summary).unwrap_or_default(),
            rationale: obj.get("rationale").map(value_to_summary).unwrap_or_default(),
        })
    }
}

impl StateTask {
    fn deserialize_lenient(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            id: obj.get("id").map(value_to_summary).unwrap_or_default(),
            status: obj.get("status").map(value_to_summary).unwrap_or_default(),
        })
    }
}

/// Generates the project state from session chunks and persists it.
pub fn generate_state(storage: &NdjsonStorage, client: &OllamaClient) -> Result<ProjectState> {
    let config = storage.read_config()?;
    // Force a re-chunk so hook-grown transcripts contribute fresh content.
    crate::chunker::chunk_all_sessions(storage, &config.chunking, true)?;

    let mut texts: Vec<(String, f64)> = Vec::new();
    let mut source_sessions: Vec<String> = Vec::new();
    for dir in storage.session_dirs_sorted() {
        let Some(session_id) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if !storage.has_chunks(&session_id) {
            continue;
        }
        source_sessions.push(session_id.clone());
        for chunk in storage.read_chunks(&session_id)? {
            let text = chunk.text.trim().to_string();
            if !text.is_empty() {
                texts.push((text, chunk.quality_score));
            }
        }
    }

    let combined = sample_chunk_texts(&texts, SAMPLE_CHAR_BUDGET);
    let prompt = if combined.is_empty() {
        "(No session data available)".to_string()
    } else {
        combined
    };

    let response = client.chat_json(&prompt, Some(SYSTEM_PROMPT), 0.0, 42)?;

    let mut state = coerce_state(&response);
    state.updated_at = now_epoch();
    state.source_sessions = source_sessions;

    storage.save_state(&state)?;
    Ok(state)
}

/// Loads the cached state, regenerating when missing or stale.
pub fn load_or_generate_state(
    storage: &NdjsonStorage,
    client: &OllamaClient,
) -> Result<ProjectState> {
    match storage.load_state()? {
        Some(state) if !storage.state_is_stale() => Ok(state),
        _ => generate_state(storage, client),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn test_sample_empty() {
        assert_eq!(sample_chunk_texts(&[], 100), "");
    }

    #[test]
    fn test_sample_always_anchors_first_and_last() {
        let texts = vec![
            ("first".to_string(), 0.1),
            ("middle high quality".to_string(), 0.99),
            ("last".to_string(), 0.1),
        ];
        // Budget fits only the anchors.
        let sampled = sample_chunk_texts(&texts, 10);
        assert!(sampled.starts_with("first"));
        assert!(sampled.ends_with("last"));
        assert!(!sampled.contains("middle"));
    }

    #[test]
    fn test_sample_greedy_by_quality_chronological_order() {
        let texts = vec![
            ("alpha".to_string(), 0.2),
            ("bravo".to_string(), 0.9),
            ("charlie".to_string(), 0.4),
            ("delta".to_string(), 0.8),
            ("echo".to_string(), 0.2),
        ];
        // Anchors (10 chars) plus room for the two best middles.
        let sampled = sample_chunk_texts(&texts, 22);
        let parts: Vec<&str> = sampled.split("\n\n").collect();
        assert_eq!(parts, vec!["alpha", "bravo", "delta", "echo"]);
    }

    #[test]
    fn test_sample_single_chunk() {
        let texts = vec![("only".to_string(), 0.5)];
        assert_eq!(sample_chunk_texts(&texts, 100), "only");
    }

    #[test]
    fn test_coerce_full_object() {
        let value = json!({
            "summary": "A tool.",
            "decisions": [{"id": "D1", "statement": "s", "rationale": "r"}],
            "constraints": ["c1", "c2"],
            "tasks": [{"id": "T1", "status": "pending"}],
        });
        let state = coerce_state(&value);
        assert_eq!(state.summary, "A tool.");
        assert_eq!(state.decisions.len(), 1);
        assert_eq!(state.decisions[0].id, "D1");
        assert_eq!(state.constraints, vec!["c1", "c2"]);
        assert_eq!(state.tasks[0].status, "pending");
    }

    #[test]
    fn test_coerce_non_object_becomes_summary() {
        let state = coerce_state(&json!("just a sentence"));
        assert_eq!(state.summary, "just a sentence");
        assert!(state.decisions.is_empty());
        assert!(state.constraints.is_empty());
        assert!(state.tasks.is_empty());
    }

    #[test]
    fn test_coerce_tolerates_malformed_entries() {
        let value = json!({
            "summary": "ok",
            "decisions": [{"id": "D1"}, "not an object", 42],
            "constraints": [1, "real"],
            "tasks": "none",
        });
        let state = coerce_state(&value);
        assert_eq!(state.decisions.len(), 1);
        assert_eq!(state.decisions[0].statement, "");
        assert_eq!(state.constraints, vec!["1", "real"]);
        assert!(state.tasks.is_empty());
    }
}
