//! Artifact-specific chunking for todos, plans, and tasks.
//!
//! Artifact chunks live in `artifacts/chunks.jsonl` and are indexed
//! alongside session chunks. They carry an `artifact_type` extra so that
//! search can filter on them and decay boosting can skip them.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::core::models::{quality_score, token_estimate, Chunk, TaskItem, TodoList};

fn artifact_extra(artifact_type: &str, artifact_id: &str) -> BTreeMap<String, Value> {
    let mut extra = BTreeMap::new();
    extra.insert("artifact_type".to_string(), Value::String(artifact_type.into()));
    extra.insert("source".to_string(), Value::String("artifact".into()));
    extra.insert("artifact_id".to_string(), Value::String(artifact_id.into()));
    extra
}

fn make_chunk(
    chunk_id: String,
    session_id: String,
    index: usize,
    text: String,
    ts: f64,
    extra: BTreeMap<String, Value>,
) -> Chunk {
    Chunk {
        chunk_id,
        session_id,
        index,
        token_estimate: token_estimate(&text),
        quality_score: quality_score(&text),
        text,
        ts_start: ts,
        ts_end: ts,
        extra,
    }
}

/// One chunk per non-empty todo list:
/// `[TODO] {status} ({priority}): {content}` per item, newline-separated.
#[must_use]
pub fn chunk_todo_list(todo_list: &TodoList) -> Vec<Chunk> {
    if todo_list.items.is_empty() {
        return Vec::new();
    }

    let text = todo_list
        .items
        .iter()
        .map(|item| {
            format!(
                "[TODO] {} ({}): {}",
                item.status.as_str(),
                item.priority,
                item.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    vec![make_chunk(
        format!("artifact-todo-{}-0", todo_list.session_id),
        todo_list.session_id.clone(),
        0,
        text,
        todo_list.mtime,
        artifact_extra("todo", &todo_list.session_id),
    )]
}

/// Splits a plan by `##` headings; each section becomes one chunk tagged
/// `[PLAN: {slug}]`.
#[must_use]
pub fn chunk_plan(slug: &str, content: &str, mtime: f64) -> Vec<Chunk> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    for (idx, (heading, section)) in split_by_headings(content).into_iter().enumerate() {
        let text = if heading.is_empty() {
            format!("[PLAN: {slug}]\n{section}")
        } else {
            format!("[PLAN: {slug}] ## {heading}\n{section}")
        };
        if text.trim().is_empty() {
            continue;
        }
        chunks.push(make_chunk(
            format!("artifact-plan-{slug}-{idx}"),
            format!("artifact-plan-{slug}"),
            idx,
            text,
            mtime,
            artifact_extra("plan", slug),
        ));
    }
    chunks
}

/// One chunk per task:
/// `[TASK] {subject} ({status})` plus description and dependency lines.
#[must_use]
pub fn chunk_task(task: &TaskItem) -> Chunk {
    let mut parts = vec![format!("[TASK] {} ({})", task.subject, task.status.as_str())];
    if !task.description.is_empty() {
        parts.push(task.description.clone());
    }
    if !task.blocks.is_empty() {
        parts.push(format!("Blocks: {}", task.blocks.join(", ")));
    }
    if !task.blocked_by.is_empty() {
        parts.push(format!("Blocked by: {}", task.blocked_by.join(", ")));
    }
    let text = parts.join("\n");

    let index = task.id.parse::<usize>().unwrap_or(0);
    make_chunk(
        format!("artifact-task-{}-{}", task.session_id, task.id),
        task.session_id.clone(),
        index,
        text,
        0.0,
        artifact_extra("task", &task.session_id),
    )
}

/// Splits Markdown content by `##` headings. The first entry may carry an
/// empty heading when content precedes the first heading.
fn split_by_headings(content: &str) -> Vec<(String, String)> {
    let mut sections = Vec::new();
    let mut current_heading = String::new();
    let mut current_lines: Vec<&str> = Vec::new();

    for line in content.split('\n') {
        if let Some(rest) = line.strip_prefix("## ") {
            if !current_lines.is_empty() || !current_heading.is_empty() {
                sections.push((current_heading.clone(), current_lines.join("\n").trim().to_string()));
            }
            current_heading = rest.trim().to_string();
            current_lines = Vec::new();
        } else {
            current_lines.push(line);
        }
    }

    if !current_lines.is_empty() || !current_heading.is_empty() {
        sections.push((current_heading, current_lines.join("\n").trim().to_string()));
    }

    sections
}
