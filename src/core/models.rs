//! Canonical data models for Memory Bank domain entities.
//!
//! All entities are immutable once written to storage. Serde derives define
//! the on-disk JSON shape; round-trip fidelity over the representable subset
//! is covered by the tests at the bottom of this module.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::priority::Priority;

/// Ingestion source of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// Captured live through the PTY supervisor.
    Pty,
    /// Created by the Claude Code Stop hook.
    Hook,
    /// Imported retroactively from a Claude Code project directory.
    Import,
}

impl EventSource {
    /// Returns the string tag stored in `meta.json`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pty => "pty",
            Self::Hook => "hook",
            Self::Import => "import",
        }
    }
}

/// Output format for context packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackFormat {
    /// XML envelope (default).
    Xml,
    /// Single JSON object.
    Json,
    /// Markdown document.
    Markdown,
}

impl PackFormat {
    /// Parses a format string (case-insensitive). Returns `None` for
    /// unrecognized values.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "xml" => Some(Self::Xml),
            "json" => Some(Self::Json),
            "md" | "markdown" => Some(Self::Markdown),
            _ => None,
        }
    }
}

/// Scores chunk quality: ratio of alphanumeric content to total length of
/// the trimmed text, rounded to 3 decimals. Whitespace-only text scores 0.0.
#[must_use]
pub fn quality_score(text: &str) -> f64 {
    let stripped = text.trim();
    if stripped.is_empty() {
        return 0.0;
    }
    let total = stripped.chars().count();
    let alnum = stripped.chars().filter(|c| c.is_alphanumeric()).count();
    ((alnum as f64 / total as f64) * 1000.0).round() / 1000.0
}

/// Estimates token count as `chars / 4`.
#[must_use]
pub fn token_estimate(text: &str) -> usize {
    text.chars().count() / 4
}

/// Generates a deterministic event id from `(session_id, ts)`: the first
/// 16 hex chars of `sha256("{session_id}:{ts}")`.
#[must_use]
pub fn generate_event_id(session_id: &str, ts: f64) -> String {
    let raw = format!("{session_id}:{ts:?}");
    let digest = Sha256::digest(raw.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Lenient enum deserializer: unknown values fall back to `Default` instead
/// of failing the whole record. Artifact files written by external tools may
/// carry vocabulary we do not know.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

/// Like [`lenient`] but for optional enums: unknown values become `None`.
fn lenient_opt<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).ok())
}

/// Accepts either a JSON string or number and yields a string. Claude Code
/// artifact files are inconsistent about numeric ids.
fn stringify<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

// ---------------------------------------------------------------------------
// Session entities
// ---------------------------------------------------------------------------

/// A single timestamped entry from a captured session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Deterministic fingerprint of `(session_id, ts)`.
    #[serde(default)]
    pub event_id: String,
    /// Seconds — monotonic for PTY captures, wall-clock otherwise.
    #[serde(default)]
    pub ts: f64,
    /// Owning session.
    #[serde(default)]
    pub session_id: String,
    /// One of stdin / stdout / stderr / system.
    #[serde(default)]
    pub stream: String,
    /// Free-form role tag (user, terminal, system).
    #[serde(default)]
    pub role: String,
    /// Sanitized and redacted text.
    #[serde(default)]
    pub content: String,
}

impl Event {
    /// Fills in a missing `event_id` from `(session_id, ts)`.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.event_id.is_empty() {
            self.event_id = generate_event_id(&self.session_id, self.ts);
        }
        self
    }
}

/// Metadata about a captured session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    /// `YYYYMMDD-HHMMSS-XXXX` identifier.
    pub session_id: String,
    /// Captured argv (may be empty).
    #[serde(default)]
    pub command: Vec<String>,
    /// Absolute working directory.
    #[serde(default)]
    pub cwd: String,
    /// Seconds since epoch.
    #[serde(default)]
    pub started_at: f64,
    /// Absent until the session is finalized.
    #[serde(default)]
    pub ended_at: Option<f64>,
    /// Child exit code, absent while running.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// How the session entered storage.
    #[serde(default, deserialize_with = "lenient_opt", skip_serializing_if = "Option::is_none")]
    pub source: Option<EventSource>,
}

/// A semantically meaningful text segment extracted from session events.
///
/// Unknown keys read from `chunks.jsonl` are preserved in `extra` so that
/// forward-compatible fields (artifact tags, turn numbers, future metadata)
/// survive a read-modify-write cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique id within the project (`<session_id>-<index>` for sessions).
    #[serde(default)]
    pub chunk_id: String,
    /// Owning session (or synthetic artifact session id).
    #[serde(default)]
    pub session_id: String,
    /// 0-based position within the session.
    #[serde(default)]
    pub index: usize,
    /// Chunk text.
    #[serde(default)]
    pub text: String,
    /// Seconds since epoch (or session-relative for PTY captures).
    #[serde(default)]
    pub ts_start: f64,
    /// Seconds since epoch; `ts_end >= ts_start`.
    #[serde(default)]
    pub ts_end: f64,
    /// `chars / 4`.
    #[serde(default)]
    pub token_estimate: usize,
    /// Alphanumeric ratio in `[0.0, 1.0]`.
    #[serde(default)]
    pub quality_score: f64,
    /// Unknown/optional keys (`artifact_type`, `source`, `turn_number`, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Chunk {
    /// The artifact type tag (`plan` / `todo` / `task`), absent for session
    /// chunks.
    #[must_use]
    pub fn artifact_type(&self) -> Option<&str> {
        self.extra.get("artifact_type").and_then(Value::as_str)
    }

    /// The source tag (`claude_native`, `artifact`), if any.
    #[must_use]
    pub fn source_tag(&self) -> Option<&str> {
        self.extra.get("source").and_then(Value::as_str)
    }

    /// Conversation turn number for transcript-derived chunks.
    #[must_use]
    pub fn turn_number(&self) -> Option<u64> {
        self.extra.get("turn_number").and_then(Value::as_u64)
    }

    /// True when the chunk was derived from an artifact rather than a
    /// session transcript.
    #[must_use]
    pub fn is_artifact(&self) -> bool {
        self.artifact_type().is_some()
    }
}

/// A chunk matched by semantic search with a relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Matched chunk id.
    #[serde(default)]
    pub chunk_id: String,
    /// Owning session.
    #[serde(default)]
    pub session_id: String,
    /// Chunk position.
    #[serde(default)]
    pub index: usize,
    /// Stored (truncated) chunk text.
    #[serde(default)]
    pub text: String,
    /// Chunk start time.
    #[serde(default)]
    pub ts_start: f64,
    /// Chunk end time.
    #[serde(default)]
    pub ts_end: f64,
    /// `chars / 4`.
    #[serde(default)]
    pub token_estimate: usize,
    /// Stored quality score.
    #[serde(default)]
    pub quality_score: f64,
    /// Cosine similarity, possibly decay-boosted or reranked.
    #[serde(default)]
    pub score: f64,
    /// Artifact tag, absent for session chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

/// A search result with cross-project attribution (`mb search --global`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSearchResult {
    /// Project directory the result came from.
    pub project_path: String,
    /// The underlying per-project result.
    #[serde(flatten)]
    pub result: SearchResult,
}

impl GlobalSearchResult {
    /// Attaches a project path to a per-project search result.
    #[must_use]
    pub fn from_search_result(result: SearchResult, project_path: String) -> Self {
        Self {
            project_path,
            result,
        }
    }
}

// ---------------------------------------------------------------------------
// Artifact entities
// ---------------------------------------------------------------------------

/// Status of a todo item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    /// Not started.
    #[default]
    Pending,
    /// Currently being worked on.
    InProgress,
    /// Done.
    Completed,
}

impl TodoStatus {
    /// Returns the string tag.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    /// True for pending or in-progress items.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// Status of a task-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started.
    #[default]
    Pending,
    /// Currently being worked on.
    InProgress,
    /// Done.
    Completed,
    /// Removed from the tree.
    Deleted,
}

impl TaskStatus {
    /// Returns the string tag.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Deleted => "deleted",
        }
    }

    /// True for pending or in-progress tasks.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// A single todo item from a Claude Code todo list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    /// Item id (stringified).
    #[serde(default, deserialize_with = "stringify")]
    pub id: String,
    /// Item text.
    #[serde(default)]
    pub content: String,
    /// Lifecycle status; unknown values coerce to `pending`.
    #[serde(default, deserialize_with = "lenient")]
    pub status: TodoStatus,
    /// Priority; unknown values coerce to `medium`.
    #[serde(default, deserialize_with = "lenient")]
    pub priority: Priority,
    /// Present-tense form shown while in progress.
    #[serde(
        default,
        rename = "activeForm",
        alias = "active_form",
        skip_serializing_if = "Option::is_none"
    )]
    pub active_form: Option<String>,
}

/// A complete todo list file associated with a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoList {
    /// Owning session.
    #[serde(default)]
    pub session_id: String,
    /// Subagent id when the list belongs to a subagent.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// The items, in file order.
    #[serde(default)]
    pub items: Vec<TodoItem>,
    /// Source file path.
    #[serde(default)]
    pub file_path: String,
    /// Source file mtime (epoch seconds).
    #[serde(default)]
    pub mtime: f64,
}

/// Metadata for an imported plan, stored alongside the plan Markdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMeta {
    /// Slug identifying the plan document.
    #[serde(default)]
    pub slug: String,
    /// Session the plan came from.
    #[serde(default)]
    pub session_id: String,
    /// Original timestamp string, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Source file path.
    #[serde(default)]
    pub file_path: String,
    /// Source file mtime (epoch seconds).
    #[serde(default)]
    pub mtime: f64,
}

/// A single task from a Claude Code task tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    /// Task id (stringified).
    #[serde(default, deserialize_with = "stringify")]
    pub id: String,
    /// Owning session.
    #[serde(default)]
    pub session_id: String,
    /// One-line subject.
    #[serde(default)]
    pub subject: String,
    /// Longer description.
    #[serde(default)]
    pub description: String,
    /// Present-tense form shown while in progress.
    #[serde(
        default,
        rename = "activeForm",
        alias = "active_form",
        skip_serializing_if = "Option::is_none"
    )]
    pub active_form: Option<String>,
    /// Lifecycle status; unknown values coerce to `pending`.
    #[serde(default, deserialize_with = "lenient")]
    pub status: TaskStatus,
    /// Task ids this task blocks. The graph is a DAG by convention; the
    /// core does not validate acyclicity.
    #[serde(default)]
    pub blocks: Vec<String>,
    /// Task ids that must complete first.
    #[serde(default, rename = "blockedBy", alias = "blocked_by")]
    pub blocked_by: Vec<String>,
}

// ---------------------------------------------------------------------------
// Project state and registry
// ---------------------------------------------------------------------------

/// One recorded decision inside [`ProjectState`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Decision {
    /// Stable id (D1, D2, ...).
    #[serde(default)]
    pub id: String,
    /// What was decided.
    #[serde(default)]
    pub statement: String,
    /// Why.
    #[serde(default)]
    pub rationale: String,
}

/// One task entry inside [`ProjectState`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateTask {
    /// Stable id (T1, T2, ...).
    #[serde(default)]
    pub id: String,
    /// Free-form status string as produced by the summarizer.
    #[serde(default)]
    pub status: String,
}

/// An LLM-generated summary of the project state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProjectState {
    /// 2-3 sentence overview.
    #[serde(default)]
    pub summary: String,
    /// Key decisions.
    #[serde(default)]
    pub decisions: Vec<Decision>,
    /// Identified constraints.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Active tasks.
    #[serde(default)]
    pub tasks: Vec<StateTask>,
    /// When the snapshot was generated (epoch seconds).
    #[serde(default)]
    pub updated_at: f64,
    /// Sessions that fed the snapshot.
    #[serde(default)]
    pub source_sessions: Vec<String>,
}

/// A registered Memory Bank project in the global registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEntry {
    /// When the project was registered (epoch seconds).
    #[serde(default)]
    pub registered_at: f64,
    /// Last successful import (epoch seconds, 0 = never).
    #[serde(default)]
    pub last_import: f64,
    /// Session count at last import.
    #[serde(default)]
    pub session_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_quality_score_bounds() {
        assert!((quality_score("abc123") - 1.0).abs() < 1e-9);
        assert!((quality_score("   ") - 0.0).abs() < 1e-9);
        assert!((quality_score("") - 0.0).abs() < 1e-9);
        let q = quality_score("a b c ---");
        assert!(q > 0.0 && q < 1.0);
    }

    #[test]
    fn test_quality_score_rounding() {
        // 1 alnum of 3 chars -> 0.333
        assert!((quality_score("a--") - 0.333).abs() < 1e-9);
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(token_estimate(""), 0);
        assert_eq!(token_estimate("abcd"), 1);
        assert_eq!(token_estimate("abcdefg"), 1);
        assert_eq!(token_estimate("abcdefgh"), 2);
    }

    #[test]
    fn test_generate_event_id_deterministic() {
        let a = generate_event_id("s1", 1.5);
        let b = generate_event_id("s1", 1.5);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, generate_event_id("s1", 2.5));
    }

    #[test]
    fn test_event_normalized_fills_id() {
        let event: Event = serde_json::from_str(
            r#"{"ts": 1.0, "session_id": "s", "stream": "stdout", "role": "terminal", "content": "x"}"#,
        )
        .unwrap_or_else(|_| unreachable!());
        let event = event.normalized();
        assert_eq!(event.event_id, generate_event_id("s", 1.0));
    }

    #[test]
    fn test_session_meta_roundtrip() {
        let meta = SessionMeta {
            session_id: "20260101-120000-abcd".into(),
            command: vec!["echo".into(), "hi".into()],
            cwd: "/tmp/project".into(),
            started_at: 100.0,
            ended_at: Some(105.0),
            exit_code: Some(0),
            source: Some(EventSource::Pty),
        };
        let json = serde_json::to_string(&meta).unwrap_or_default();
        let back: SessionMeta = serde_json::from_str(&json).unwrap_or_else(|_| unreachable!());
        assert_eq!(meta, back);
    }

    #[test]
    fn test_session_meta_unknown_source_tolerated() {
        let meta: SessionMeta = serde_json::from_str(
            r#"{"session_id": "s", "command": [], "cwd": "/", "started_at": 1.0,
                "ended_at": null, "exit_code": null, "source": "telepathy"}"#,
        )
        .unwrap_or_else(|_| unreachable!());
        assert_eq!(meta.source, None);
    }

    #[test]
    fn test_chunk_preserves_unknown_keys() {
        let json = r#"{"chunk_id": "s-0", "session_id": "s", "index": 0, "text": "t",
                       "ts_start": 0.0, "ts_end": 1.0, "token_estimate": 0,
                       "quality_score": 0.5, "artifact_type": "plan",
                       "turn_number": 3, "mystery": "kept"}"#;
        let chunk: Chunk = serde_json::from_str(json).unwrap_or_else(|_| unreachable!());
        assert_eq!(chunk.artifact_type(), Some("plan"));
        assert_eq!(chunk.turn_number(), Some(3));
        let out = serde_json::to_value(&chunk).unwrap_or_default();
        assert_eq!(out["mystery"], "kept");
    }

    #[test]
    fn test_todo_item_coerces_unknown_vocab() {
        let item: TodoItem = serde_json::from_str(
            r#"{"id": 1, "content": "x", "status": "bogus", "priority": "urgent"}"#,
        )
        .unwrap_or_else(|_| unreachable!());
        assert_eq!(item.id, "1");
        assert_eq!(item.status, TodoStatus::Pending);
        assert_eq!(item.priority, Priority::Medium);
    }

    #[test]
    fn test_task_item_blocked_by_aliases() {
        let a: TaskItem =
            serde_json::from_str(r#"{"id": "1", "session_id": "s", "blockedBy": ["2"]}"#)
                .unwrap_or_else(|_| unreachable!());
        let b: TaskItem =
            serde_json::from_str(r#"{"id": "1", "session_id": "s", "blocked_by": ["2"]}"#)
                .unwrap_or_else(|_| unreachable!());
        assert_eq!(a.blocked_by, vec!["2".to_string()]);
        assert_eq!(a.blocked_by, b.blocked_by);
    }

    #[test]
    fn test_project_state_roundtrip() {
        let state = ProjectState {
            summary: "A project.".into(),
            decisions: vec![Decision {
                id: "D1".into(),
                statement: "Use NDJSON".into(),
                rationale: "simple".into(),
            }],
            constraints: vec!["single node".into()],
            tasks: vec![StateTask {
                id: "T1".into(),
                status: "pending".into(),
            }],
            updated_at: 42.0,
            source_sessions: vec!["s1".into()],
        };
        let json = serde_json::to_string(&state).unwrap_or_default();
        let back: ProjectState = serde_json::from_str(&json).unwrap_or_else(|_| unreachable!());
        assert_eq!(state, back);
    }

    proptest! {
        #[test]
        fn prop_quality_score_in_unit_interval(text in ".*") {
            let q = quality_score(&text);
            prop_assert!((0.0..=1.0).contains(&q));
        }

        #[test]
        fn prop_event_roundtrip(ts in 0.0f64..1e9, content in ".*") {
            let event = Event {
                event_id: generate_event_id("s", ts),
                ts,
                session_id: "s".into(),
                stream: "stdout".into(),
                role: "terminal".into(),
                content,
            };
            let json = serde_json::to_string(&event).unwrap_or_default();
            let back: Event = serde_json::from_str(&json).unwrap_or_else(|_| unreachable!());
            prop_assert_eq!(event, back);
        }
    }
}
