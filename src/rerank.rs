//! LLM-based reranker for search results.
//!
//! A second-pass relevance filter after cosine similarity: the chat model
//! scores each candidate snippet 0-10 against the query. On any failure
//! (server down, timeout, unparseable response) the original vector order
//! is returned unchanged.

use serde_json::Value;

use crate::core::models::SearchResult;
use crate::ollama::OllamaClient;

const SYSTEM_PROMPT: &str = "You are a relevance judge. Given a search query and a list of text snippets, \
rate each snippet's relevance to the query on a scale of 0 to 10.\n\
0 = completely irrelevant, 10 = perfectly relevant.\n\
Respond ONLY with JSON: {\"scores\": [<int>, ...]}\n\
The scores array must have exactly one integer per snippet, in order.";

/// Snippet length sent to the judge.
const SNIPPET_CHARS: usize = 300;

fn build_user_prompt(query: &str, candidates: &[SearchResult]) -> String {
    let mut lines = vec![format!("Query: {query}"), String::new(), "Snippets:".to_string()];
    for (i, candidate) in candidates.iter().enumerate() {
        let snippet: String = candidate
            .text
            .chars()
            .take(SNIPPET_CHARS)
            .map(|c| if c == '\n' { ' ' } else { c })
            .collect();
        lines.push(format!("[{i}] {snippet}"));
    }
    lines.join("\n")
}

/// Parses `{"scores": [...]}` and normalizes 0-10 to 0.0-1.0, clamping out
/// of range values. Errors on shape or count mismatch.
fn parse_scores(raw: &Value, expected: usize) -> Option<Vec<f64>> {
    let scores = raw.get("scores")?.as_array()?;
    if scores.len() != expected {
        return None;
    }
    let mut result = Vec::with_capacity(expected);
    for s in scores {
        let value = s.as_f64()?;
        result.push(value.clamp(0.0, 10.0) / 10.0);
    }
    Some(result)
}

/// Reranks candidates by LLM relevance. Returns `top_k` results ordered by
/// the judge's scores, or the original top-k on any failure.
#[must_use]
pub fn rerank(
    query: &str,
    candidates: Vec<SearchResult>,
    client: &OllamaClient,
    top_k: usize,
) -> Vec<SearchResult> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let user_prompt = build_user_prompt(query, &candidates);
    let response = match client.chat_json(&user_prompt, Some(SYSTEM_PROMPT), 0.0, 42) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(%err, "reranker failed, falling back to vector scores");
            return candidates.into_iter().take(top_k).collect();
        }
    };

    let Some(scores) = parse_scores(&response, candidates.len()) else {
        tracing::warn!("reranker returned an unusable response, falling back to vector scores");
        return candidates.into_iter().take(top_k).collect();
    };

    let mut scored: Vec<SearchResult> = candidates
        .into_iter()
        .zip(scores)
        .map(|(mut candidate, llm_score)| {
            candidate.score = llm_score;
            candidate
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(top_k);
    scored
}
