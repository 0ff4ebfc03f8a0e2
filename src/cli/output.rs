//! CLI output formatting: tables, search results, timestamps.

use chrono::{DateTime, Utc};

use crate::core::models::{GlobalSearchResult, SearchResult, SessionMeta};
use crate::graph::SessionNode;
use crate::storage::ArtifactCounts;

/// Formats an epoch timestamp as a UTC date-time, or `?` when unset.
fn format_started(started_at: f64) -> String {
    if started_at <= 0.0 {
        return "?".to_string();
    }
    DateTime::<Utc>::from_timestamp(started_at as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "?".to_string())
}

/// `sessions` table: id, command, started (UTC), exit code.
#[must_use]
pub fn format_sessions_table(sessions: &[SessionMeta], counts: &ArtifactCounts) -> String {
    let mut lines = Vec::with_capacity(sessions.len() + 1);
    lines.push(format!(
        "{:<25}{:<12}{:<22}{}",
        "SESSION", "COMMAND", "STARTED", "EXIT"
    ));
    for s in sessions {
        let command = s.command.join(" ");
        let exit = s.exit_code.map_or("-".to_string(), |c| c.to_string());
        lines.push(format!(
            "{:<25}{:<12}{:<22}{}",
            s.session_id,
            command,
            format_started(s.started_at),
            exit
        ));
    }

    if !counts.is_empty() {
        let mut parts = Vec::new();
        if counts.plans > 0 {
            parts.push(format!("{} plans", counts.plans));
        }
        if counts.todos > 0 {
            parts.push(format!(
                "{} todo lists ({} active items)",
                counts.todos, counts.todo_active_items
            ));
        }
        if counts.tasks > 0 {
            parts.push(format!(
                "{} task trees ({} pending tasks)",
                counts.tasks, counts.task_pending
            ));
        }
        if !parts.is_empty() {
            lines.push(String::new());
            lines.push(format!("Artifacts: {}", parts.join(", ")));
        }
    }

    lines.join("\n")
}

/// `graph` table: session, episode, error flag, command.
#[must_use]
pub fn format_graph_table(nodes: &[SessionNode]) -> String {
    let mut lines = Vec::with_capacity(nodes.len() + 1);
    lines.push(format!(
        "{:<25}{:<12}{:<8}{}",
        "SESSION", "EPISODE", "ERROR", "COMMAND"
    ));
    for node in nodes {
        lines.push(format!(
            "{:<25}{:<12}{:<8}{}",
            node.meta.session_id,
            node.episode_type,
            if node.has_error { "YES" } else { "-" },
            node.meta.command.join(" ")
        ));
    }
    lines.join("\n")
}

/// `graph --json` payload.
#[must_use]
pub fn format_graph_json(nodes: &[SessionNode]) -> String {
    let items: Vec<serde_json::Value> = nodes
        .iter()
        .map(|n| {
            serde_json::json!({
                "session_id": n.meta.session_id,
                "episode_type": n.episode_type.as_str(),
                "has_error": n.has_error,
                "error_summary": n.error_summary,
                "command": n.meta.command.join(" "),
                "related_sessions": n.related_sessions,
            })
        })
        .collect();
    serde_json::to_string_pretty(&items).unwrap_or_default()
}

fn snippet_of(text: &str) -> String {
    let snippet: String = text
        .chars()
        .take(200)
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect();
    let snippet = snippet.trim().to_string();
    if text.chars().count() > 200 {
        format!("{snippet}...")
    } else {
        snippet
    }
}

fn format_clock(ts: f64) -> String {
    if ts > 1_000_000_000.0 {
        DateTime::<Utc>::from_timestamp(ts as i64, 0)
            .map(|dt| dt.format("%H:%M").to_string())
            .unwrap_or_else(|| "?".to_string())
    } else {
        // Session-relative seconds.
        format!("{:02}:{:02}", (ts / 60.0) as u64, (ts % 60.0) as u64)
    }
}

fn result_ident(result: &SearchResult) -> String {
    match result.artifact_type.as_deref() {
        None => format!(
            "{} ({} - {})",
            result.session_id,
            format_clock(result.ts_start),
            format_clock(result.ts_end)
        ),
        Some("plan") => {
            let slug = result
                .session_id
                .strip_prefix("artifact-plan-")
                .unwrap_or(&result.session_id);
            format!("{slug} §{}", result.index)
        }
        Some("todo") => format!("{} #todo", short_id(&result.session_id)),
        Some("task") => format!("{} #task-{}", short_id(&result.session_id), result.index),
        Some(_) => result.session_id.clone(),
    }
}

fn short_id(session_id: &str) -> &str {
    session_id.get(..8).unwrap_or(session_id)
}

/// One search result in the human-readable listing.
#[must_use]
pub fn format_search_result(result: &SearchResult) -> String {
    let label = format!("[{}]", result.artifact_type.as_deref().unwrap_or("session"));
    format!(
        "{:<10}{:<35}(score: {:.2})\n  {}\n",
        label,
        result_ident(result),
        result.score,
        snippet_of(&result.text)
    )
}

/// One global search result, with home-relative project attribution.
#[must_use]
pub fn format_global_result(result: &GlobalSearchResult) -> String {
    let label = format!(
        "[{}]",
        result.result.artifact_type.as_deref().unwrap_or("session")
    );
    let home = dirs::home_dir()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let project_display = if !home.is_empty() && result.project_path.starts_with(&home) {
        format!("~{}", &result.project_path[home.len()..])
    } else {
        result.project_path.clone()
    };
    format!(
        "{:<10}{} > {} §{}  (score: {:.2})\n  {}\n",
        label,
        project_display,
        result.result.session_id,
        result.result.index,
        result.result.score,
        snippet_of(&result.result.text)
    )
}
