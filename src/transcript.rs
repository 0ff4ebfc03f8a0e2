//! Claude Code native transcript adapter.
//!
//! Reads the external CLI's structured JSONL session files from
//! `~/.claude/projects/` and extracts clean turn-based content for chunking,
//! bypassing raw PTY output entirely when a structured transcript exists.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::chunker::{char_count, char_prefix, char_suffix};
use crate::core::models::{quality_score, token_estimate, Chunk, SessionMeta};
use crate::storage::{file_mtime_epoch, ChunkingConfig};

/// Leading tags that mark command wrappers, local command output, and other
/// machine-injected user content that never represents a real prompt.
const FILTERED_PREFIXES: &[&str] = &[
    "<command-",
    "<local-command-",
    "<task-notification>",
    "<system-reminder>",
    "<local-command-caveat>",
    "<bash-input>",
    "<bash-stdout>",
    "<bash-stderr>",
];

/// A single user-to-assistant conversation turn.
#[derive(Debug, Clone, Default)]
pub struct Turn {
    /// 1-based position in the conversation.
    pub turn_number: u64,
    /// The user's prompt text.
    pub user_message: String,
    /// Assistant text blocks until the next user turn.
    pub assistant_texts: Vec<String>,
    /// ISO 8601 timestamp from the transcript, if present.
    pub timestamp: Option<String>,
}

impl Turn {
    /// The chunkable `User: ... / Assistant: ...` rendering of the turn.
    #[must_use]
    pub fn full_text(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.assistant_texts.len());
        if !self.user_message.is_empty() {
            parts.push(format!("User: {}", self.user_message));
        }
        for text in &self.assistant_texts {
            parts.push(format!("Assistant: {text}"));
        }
        parts.join("\n\n")
    }
}

/// Encodes a project path to the external CLI's directory name format:
/// `/home/user/my_project` becomes `-home-user-my-project` (both `/` and
/// `_` are replaced with `-`).
#[must_use]
pub fn encode_project_dir(cwd: &str) -> String {
    let path = cwd.trim_end_matches('/');
    let path = path.strip_prefix('/').unwrap_or(path);
    format!("-{}", path.replace(['/', '_'], "-"))
}

/// The external CLI's per-project transcript directory for `cwd`.
#[must_use]
pub fn claude_project_dir(cwd: &str) -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    Some(
        home.join(".claude")
            .join("projects")
            .join(encode_project_dir(cwd)),
    )
}

/// True when a session's recorded command is the external AI CLI.
#[must_use]
pub fn is_claude_session(meta: &SessionMeta) -> bool {
    meta.command
        .first()
        .map(|cmd| basename(cmd) == "claude")
        .unwrap_or(false)
}

fn basename(cmd: &str) -> &str {
    cmd.rsplit('/').next().unwrap_or(cmd)
}

/// Finds the transcript JSONL that matches a captured session's time window:
/// modified no more than 60 s before `started_at` and no more than 5 min
/// after `ended_at`. Ambiguous matches (several files inside the window) are
/// resolved toward the closest mtime and logged, since overlapping sessions
/// can mis-attribute files.
#[must_use]
pub fn find_claude_session_file(
    cwd: &str,
    started_at: f64,
    ended_at: Option<f64>,
) -> Option<PathBuf> {
    let project_dir = claude_project_dir(cwd)?;
    let files = transcript_files(&project_dir);
    if files.is_empty() {
        return None;
    }

    let mut candidates: Vec<(f64, PathBuf)> = files
        .iter()
        .map(|f| (file_mtime_epoch(f), f.clone()))
        .filter(|(mtime, _)| {
            *mtime >= started_at - 60.0
                && ended_at.map_or(true, |end| *mtime <= end + 300.0)
        })
        .collect();

    if candidates.is_empty() {
        // Fall back to the most recently modified transcript.
        let mut all: Vec<(f64, PathBuf)> =
            files.iter().map(|f| (file_mtime_epoch(f), f.clone())).collect();
        all.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        return all.into_iter().next().map(|(_, f)| f);
    }

    if candidates.len() > 1 {
        tracing::warn!(
            count = candidates.len(),
            "multiple transcripts match the session window; picking closest mtime"
        );
    }

    candidates.sort_by(|a, b| {
        let da = (a.0 - started_at).abs();
        let db = (b.0 - started_at).abs();
        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.into_iter().next().map(|(_, f)| f)
}

/// All transcript files for a project, sorted by name. `agent-*.jsonl`
/// subchain files are excluded.
#[must_use]
pub fn discover_claude_sessions(cwd: &str) -> Vec<PathBuf> {
    let Some(project_dir) = claude_project_dir(cwd) else {
        return Vec::new();
    };
    let mut files = transcript_files(&project_dir);
    files.sort();
    files
}

/// Todo list files in `~/.claude/todos/` whose stem matches one of this
/// project's transcripts. Empty files are skipped.
#[must_use]
pub fn discover_todos(cwd: &str) -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let todos_dir = home.join(".claude").join("todos");
    discover_claude_sessions(cwd)
        .iter()
        .filter_map(|transcript| {
            let stem = transcript.file_stem()?.to_string_lossy().into_owned();
            let candidate = todos_dir.join(format!("{stem}.json"));
            let meta = fs::metadata(&candidate).ok()?;
            (meta.len() > 0).then_some(candidate)
        })
        .collect()
}

/// Task directories in `~/.claude/tasks/` whose name matches one of this
/// project's transcripts.
#[must_use]
pub fn discover_task_dirs(cwd: &str) -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let tasks_dir = home.join(".claude").join("tasks");
    discover_claude_sessions(cwd)
        .iter()
        .filter_map(|transcript| {
            let stem = transcript.file_stem()?.to_string_lossy().into_owned();
            let candidate = tasks_dir.join(stem);
            candidate.is_dir().then_some(candidate)
        })
        .collect()
}

/// Plan slugs referenced by this project's transcripts. The external CLI
/// stamps a top-level `slug` field on lines belonging to a plan.
#[must_use]
pub fn discover_plan_slugs(cwd: &str) -> std::collections::HashSet<String> {
    let mut slugs = std::collections::HashSet::new();
    for transcript in discover_claude_sessions(cwd) {
        let Ok(file) = fs::File::open(&transcript) else {
            continue;
        };
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(data) = serde_json::from_str::<Value>(trimmed) else {
                continue;
            };
            if let Some(slug) = data.get("slug").and_then(Value::as_str) {
                slugs.insert(slug.to_string());
            }
        }
    }
    slugs
}

/// Plan files in `~/.claude/plans/` for the given slugs. Missing files are
/// silently absent from the result.
#[must_use]
pub fn discover_plans(slugs: &std::collections::HashSet<String>) -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let plans_dir = home.join(".claude").join("plans");
    let mut files: Vec<PathBuf> = slugs
        .iter()
        .map(|slug| plans_dir.join(format!("{slug}.md")))
        .filter(|p| p.exists())
        .collect();
    files.sort();
    files
}

fn transcript_files(project_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(project_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "jsonl")
                && !p
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with("agent-"))
        })
        .collect()
}

/// Parses the external CLI's JSONL transcript into conversation turns.
///
/// A turn starts at a user text message that is not a tool result, not a
/// sidechain message, and not a meta prompt; subsequent assistant text
/// blocks (never tool use, never thinking) append to the current turn until
/// the next user message. Malformed lines are skipped.
#[must_use]
pub fn extract_turns(session_file: &Path) -> Vec<Turn> {
    let Ok(file) = fs::File::open(session_file) else {
        return Vec::new();
    };

    let mut turns: Vec<Turn> = Vec::new();
    let mut current: Option<Turn> = None;
    let mut turn_number = 0;

    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(data) = serde_json::from_str::<Value>(trimmed) else {
            tracing::debug!(file = %session_file.display(), "skipping malformed transcript line");
            continue;
        };

        let msg_type = data.get("type").and_then(Value::as_str);
        if !matches!(msg_type, Some("user" | "assistant")) {
            continue;
        }
        if data.get("isSidechain").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        if data.get("isMeta").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }

        let content = data.get("message").and_then(|m| m.get("content"));
        let timestamp = data
            .get("timestamp")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        match msg_type {
            Some("user") => {
                if let Some(user_text) = content.and_then(extract_user_text) {
                    if let Some(finished) = current.take() {
                        turns.push(finished);
                    }
                    turn_number += 1;
                    current = Some(Turn {
                        turn_number,
                        user_message: user_text,
                        assistant_texts: Vec::new(),
                        timestamp,
                    });
                }
            }
            Some("assistant") => {
                if let Some(turn) = current.as_mut() {
                    if let Some(text) = content.and_then(extract_assistant_text) {
                        turn.assistant_texts.push(text);
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(finished) = current.take() {
        turns.push(finished);
    }
    turns
}

fn is_filtered_user_text(text: &str) -> bool {
    FILTERED_PREFIXES.iter().any(|p| text.starts_with(p))
        || text.to_lowercase().contains("request interrupted by user")
}

/// Extracts user prompt text, skipping tool results and command wrappers.
fn extract_user_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => {
            let text = s.trim();
            if text.is_empty() || is_filtered_user_text(text) {
                None
            } else {
                Some(text.to_string())
            }
        }
        Value::Array(items) => {
            let mut texts = Vec::new();
            for item in items {
                let Some(obj) = item.as_object() else { continue };
                if obj.get("type").and_then(Value::as_str) == Some("tool_result") {
                    continue;
                }
                if obj.get("type").and_then(Value::as_str) == Some("text") {
                    let text = obj
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim();
                    if !text.is_empty() && !is_filtered_user_text(text) {
                        texts.push(text.to_string());
                    }
                }
            }
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

/// Extracts assistant text blocks, skipping tool use and thinking.
fn extract_assistant_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => {
            let text = s.trim();
            if text.is_empty() {
                None
            } else {
                Some(text.to_string())
            }
        }
        Value::Array(items) => {
            let mut texts = Vec::new();
            for item in items {
                let Some(obj) = item.as_object() else { continue };
                if obj.get("type").and_then(Value::as_str) == Some("text") {
                    let text = obj
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim();
                    if !text.is_empty() {
                        texts.push(text.to_string());
                    }
                }
            }
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

/// Parses an ISO 8601 timestamp to epoch seconds; 0.0 when absent or
/// unparseable.
#[must_use]
pub fn parse_ts(iso: Option<&str>) -> f64 {
    let Some(iso) = iso else { return 0.0 };
    chrono::DateTime::parse_from_rfc3339(iso)
        .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
        .unwrap_or(0.0)
}

/// Generates chunks from extracted turns. Shared by the hook handler,
/// the importer, and the PTY post-processing path.
#[must_use]
pub fn chunks_from_turns(
    turns: &[Turn],
    session_id: &str,
    chunking: &ChunkingConfig,
) -> Vec<Chunk> {
    let max_chars = chunking.max_tokens * 4;
    let overlap_chars = chunking.overlap_tokens * 4;
    let mut chunks = Vec::new();
    let mut chunk_index = 0usize;

    for turn in turns {
        let text = turn.full_text();
        if text.trim().is_empty() {
            continue;
        }

        let turn_ts = parse_ts(turn.timestamp.as_deref());
        let segments = split_turn_text(&text, max_chars);
        // Overlap resets at turn boundaries.
        let mut overlap_text = String::new();

        for seg in segments {
            let chunk_text = if overlap_text.is_empty() {
                seg.clone()
            } else {
                format!("{overlap_text}{seg}")
            };

            let mut extra = std::collections::BTreeMap::new();
            extra.insert("source".to_string(), Value::String("claude_native".into()));
            extra.insert("turn_number".to_string(), Value::from(turn.turn_number));

            chunks.push(Chunk {
                chunk_id: format!("{session_id}-{chunk_index}"),
                session_id: session_id.to_string(),
                index: chunk_index,
                token_estimate: token_estimate(&chunk_text),
                quality_score: quality_score(&chunk_text),
                text: chunk_text,
                ts_start: turn_ts,
                ts_end: turn_ts,
                extra,
            });
            chunk_index += 1;

            overlap_text = char_suffix(&seg, overlap_chars);
        }
    }

    chunks
}

/// Splits turn text into segments at paragraph boundaries, force-splitting
/// any residual longer than `max_chars`.
#[must_use]
pub fn split_turn_text(text: &str, max_chars: usize) -> Vec<String> {
    if char_count(text) <= max_chars {
        return vec![text.to_string()];
    }

    let mut segments = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let candidate = if current.is_empty() {
            para.to_string()
        } else {
            format!("{current}\n\n{para}")
        };
        if char_count(&candidate) > max_chars && !current.is_empty() {
            segments.push(current);
            current = para.to_string();
        } else {
            current = candidate;
        }
    }

    if !current.trim().is_empty() {
        while char_count(&current) > max_chars {
            segments.push(char_prefix(&current, max_chars));
            current = current.chars().skip(max_chars).collect();
        }
        if !current.trim().is_empty() {
            segments.push(current);
        }
    }

    segments
}
