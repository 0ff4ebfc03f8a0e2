//! Session graph: episode classification, error detection, and temporal
//! relationship linking.
//!
//! Classification is a heuristic waterfall over `argv`. Claude sessions with
//! chunks get content-based classification: each episode's pattern counts
//! matches across all chunk text and the highest count wins, ties broken by
//! declaration order.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::models::{Chunk, SessionMeta};
use crate::error::Result;
use crate::storage::NdjsonStorage;

/// Classification of a session's purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    /// Compiling, building, packaging.
    Build,
    /// Running test suites.
    Test,
    /// Shipping to an environment.
    Deploy,
    /// Chasing a failure.
    Debug,
    /// Restructuring without behavior change.
    Refactor,
    /// Reading and understanding.
    Explore,
    /// Configuration and setup.
    Config,
    /// Documentation work.
    Docs,
    /// Code review.
    Review,
}

impl EpisodeType {
    /// String tag used in CLI output and the mode map.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Deploy => "deploy",
            Self::Debug => "debug",
            Self::Refactor => "refactor",
            Self::Explore => "explore",
            Self::Config => "config",
            Self::Docs => "docs",
            Self::Review => "review",
        }
    }

    /// Parses a tag; `None` for unknown strings.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "build" => Some(Self::Build),
            "test" => Some(Self::Test),
            "deploy" => Some(Self::Deploy),
            "debug" => Some(Self::Debug),
            "refactor" => Some(Self::Refactor),
            "explore" => Some(Self::Explore),
            "config" => Some(Self::Config),
            "docs" => Some(Self::Docs),
            "review" => Some(Self::Review),
        _ => None,
        }
    }
}

impl std::fmt::Display for EpisodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A graph node: one session with derived episode metadata.
#[derive(Debug, Clone, Serialize)]
pub struct SessionNode {
    /// The session's stored metadata.
    pub meta: SessionMeta,
    /// Heuristic purpose tag.
    pub episode_type: EpisodeType,
    /// Whether the session failed or produced error output.
    pub has_error: bool,
    /// Up to three joined error fragments, when `has_error`.
    pub error_summary: Option<String>,
    /// Session ids within the temporal neighbor window.
    pub related_sessions: Vec<String>,
}

// ---------------------------------------------------------------------------
// Heuristic tables
// ---------------------------------------------------------------------------

/// command[0] -> episode type.
const CMD_MAP: &[(&str, EpisodeType)] = &[
    ("make", EpisodeType::Build),
    ("cmake", EpisodeType::Build),
    ("ninja", EpisodeType::Build),
    ("pytest", EpisodeType::Test),
    ("jest", EpisodeType::Test),
    ("gdb", EpisodeType::Debug),
    ("lldb", EpisodeType::Debug),
    ("claude", EpisodeType::Refactor),
];

/// (command[0], command[1]) -> episode type; checked before [`CMD_MAP`].
const CMD_PAIR_MAP: &[(&str, &str, EpisodeType)] = &[
    ("cargo", "build", EpisodeType::Build),
    ("cargo", "test", EpisodeType::Test),
    ("go", "build", EpisodeType::Build),
    ("go", "test", EpisodeType::Test),
    ("npm", "test", EpisodeType::Test),
    ("npm", "run", EpisodeType::Build),
    ("docker", "build", EpisodeType::Build),
    ("docker", "push", EpisodeType::Deploy),
    ("make", "test", EpisodeType::Test),
    ("make", "install", EpisodeType::Build),
];

/// command[0] values that always mean deploy.
const DEPLOY_CMDS: &[&str] = &["kubectl", "terraform", "ansible", "ansible-playbook", "deploy"];

static TEST_SUBCOMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)\btest\b").unwrap()
});

static ERROR_KEYWORDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r"(?i)(Traceback \(most recent call last\)|FAILED |ERROR:|Exception:|panic:|FATAL|segmentation fault|core dumped)",
    )
    .unwrap()
});

/// Content patterns for classifying `claude` sessions by chunk text, in
/// declaration order (which also breaks ties).
static CONTENT_PATTERNS: LazyLock<Vec<(EpisodeType, Regex)>> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    let table = vec![
        (
            EpisodeType::Test,
            Regex::new(r"(?i)(pytest|unittest|test_|PASSED|FAILED|assert\b|coverage)").unwrap(),
        ),
        (
            EpisodeType::Build,
            Regex::new(r"(?i)(compile|build|linking|cargo build|webpack|make\b)").unwrap(),
        ),
        (
            EpisodeType::Deploy,
            Regex::new(r"(?i)(deploy|kubectl|terraform|docker push|production|staging)").unwrap(),
        ),
        (
            EpisodeType::Debug,
            Regex::new(r"(?i)(Traceback|pdb|breakpoint|debugger|stack trace)").unwrap(),
        ),
        (
            EpisodeType::Refactor,
            Regex::new(r"(?i)(refactor|rename|extract\b|restructure|simplify)").unwrap(),
        ),
        (
            EpisodeType::Explore,
            Regex::new(r"(?i)(how does|what is|explain|architecture|show me|understand)").unwrap(),
        ),
        (
            EpisodeType::Config,
            Regex::new(r"(?i)(config|\.env|settings|install\b|dependency|pyproject\.toml|yaml|setup\b)")
                .unwrap(),
        ),
        (
            EpisodeType::Docs,
            Regex::new(r"(?i)(README|documentation|docstring|CHANGELOG|markdown)").unwrap(),
        ),
        (
            EpisodeType::Review,
            Regex::new(r"(?i)(review|PR\b|pull request|code review|LGTM|audit)").unwrap(),
        ),
    ];
    table
});

/// Max temporal gap in seconds for sessions to count as neighbors.
const MAX_NEIGHBOR_GAP: f64 = 600.0;

fn basename(cmd: &str) -> &str {
    cmd.rsplit('/').next().unwrap_or(cmd)
}

fn classify_from_content(chunks: &[Chunk]) -> EpisodeType {
    let mut best = EpisodeType::Refactor;
    let mut best_count = 0usize;
    for (episode, pattern) in CONTENT_PATTERNS.iter() {
        let count: usize = chunks
            .iter()
            .map(|c| pattern.find_iter(&c.text).count())
            .sum();
        // Strictly greater keeps declaration-order tie-breaking.
        if count > best_count {
            best_count = count;
            best = *episode;
        }
    }
    best
}

/// Builds session nodes with episode classification and relationship
/// linking.
#[derive(Debug, Default)]
pub struct SessionGraph;

impl SessionGraph {
    /// Creates a graph builder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Classifies a session's episode type from command heuristics. When
    /// the command is `claude` and chunks are available, delegates to
    /// content-based classification.
    #[must_use]
    pub fn classify_episode(&self, meta: &SessionMeta, chunks: &[Chunk]) -> EpisodeType {
        let Some(cmd0_raw) = meta.command.first() else {
            return EpisodeType::Build;
        };
        let cmd0 = basename(cmd0_raw);

        if cmd0 == "claude" && !chunks.is_empty() {
            return classify_from_content(chunks);
        }

        if meta.command.len() >= 2 {
            let cmd1 = meta.command[1].as_str();
            for (a, b, episode) in CMD_PAIR_MAP {
                if *a == cmd0 && *b == cmd1 {
                    return *episode;
                }
            }
        }

        if cmd0 == "python" && meta.command.len() >= 3 && meta.command[1] == "-m" {
            match meta.command[2].as_str() {
                "pdb" => return EpisodeType::Debug,
                "pytest" => return EpisodeType::Test,
                _ => {}
            }
        }

        if DEPLOY_CMDS.contains(&cmd0) {
            return EpisodeType::Deploy;
        }

        for (cmd, episode) in CMD_MAP {
            if *cmd == cmd0 {
                return *episode;
            }
        }

        if meta.command[1..]
            .iter()
            .any(|arg| TEST_SUBCOMMAND_RE.is_match(arg))
        {
            return EpisodeType::Test;
        }

        EpisodeType::Build
    }

    /// True when the session exited non-zero or any chunk matches the error
    /// keywords.
    #[must_use]
    pub fn detect_error(&self, meta: &SessionMeta, chunks: &[Chunk]) -> bool {
        if matches!(meta.exit_code, Some(code) if code != 0) {
            return true;
        }
        chunks.iter().any(|c| ERROR_KEYWORDS_RE.is_match(&c.text))
    }

    /// Extracts up to three `"; "`-joined error fragments: an exit-code tag
    /// first, then each unique line containing an error keyword in order of
    /// occurrence. `None` when nothing matches.
    #[must_use]
    pub fn extract_error_summary(&self, meta: &SessionMeta, chunks: &[Chunk]) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();

        if let Some(code) = meta.exit_code {
            if code != 0 {
                parts.push(format!("Exit code {code}"));
            }
        }

        for chunk in chunks {
            if let Some(m) = ERROR_KEYWORDS_RE.find(&chunk.text) {
                let start = m.start();
                let line_start = chunk.text[..start].rfind('\n').map_or(0, |i| i + 1);
                let line_end = chunk.text[start..]
                    .find('\n')
                    .map_or(chunk.text.len(), |i| start + i);
                let error_line = chunk.text[line_start..line_end].trim().to_string();
                if !error_line.is_empty() && !parts.contains(&error_line) {
                    parts.push(error_line);
                }
            }
        }

        if parts.is_empty() {
            return None;
        }
        parts.truncate(3);
        Some(parts.join("; "))
    }

    /// Session ids whose time window lies within 600 s of the target's.
    #[must_use]
    pub fn find_related_sessions(
        &self,
        session_id: &str,
        all_metas: &[SessionMeta],
    ) -> Vec<String> {
        let Some(target) = all_metas.iter().find(|m| m.session_id == session_id) else {
            return Vec::new();
        };

        let t_start = target.started_at;
        let t_end = target.ended_at.unwrap_or(target.started_at);

        all_metas
            .iter()
            .filter(|m| m.session_id != session_id)
            .filter(|m| {
                let m_start = m.started_at;
                let m_end = m.ended_at.unwrap_or(m.started_at);
                let gap = (t_start - m_end)
                    .abs()
                    .min((m_start - t_end).abs())
                    .min((t_start - m_start).abs());
                gap <= MAX_NEIGHBOR_GAP
            })
            .map(|m| m.session_id.clone())
            .collect()
    }

    /// Builds the full graph from storage.
    pub fn build_graph(&self, storage: &NdjsonStorage) -> Result<Vec<SessionNode>> {
        let all_metas = storage.list_sessions();
        let mut nodes = Vec::with_capacity(all_metas.len());

        for meta in &all_metas {
            let chunks = storage.read_chunks(&meta.session_id)?;
            let episode_type = self.classify_episode(meta, &chunks);
            let has_error = self.detect_error(meta, &chunks);
            let error_summary = if has_error {
                self.extract_error_summary(meta, &chunks)
            } else {
                None
            };
            let related_sessions = self.find_related_sessions(&meta.session_id, &all_metas);

            nodes.push(SessionNode {
                meta: meta.clone(),
                episode_type,
                has_error,
                error_summary,
                related_sessions,
            });
        }

        Ok(nodes)
    }
}
