//! Context pack builder: retrieve, dedup, budget, render.
//!
//! The orchestration is thin by design: retrieval strategies, the budgeter,
//! and the renderers each own their piece. This module decides which pieces
//! run for the chosen mode and enforces the final token budget per format.

use crate::core::budgeter::{apply_budget_with, estimate_tokens, truncate_elements, Section};
use crate::core::decay::effective_decay;
use crate::core::models::{Chunk, PackFormat, ProjectState};
use crate::core::Priority;
use crate::error::Result;
use crate::ollama::OllamaClient;
use crate::pack_modes::{find_latest_error_session, infer_mode, load_profile, PackMode};
use crate::renderers::{
    renderer_for, ActiveItem, PlanSummary, XmlRenderer, XML_ENVELOPE_CLOSE, XML_ENVELOPE_OPEN,
    XML_SECTION_ORDER,
};
use crate::retriever::{ContextualRetriever, RecencyRetriever, Retriever};
use crate::storage::NdjsonStorage;

/// Recent plans included in a pack.
const MAX_PLANS: usize = 3;

/// Todo/task session files consulted for active items.
const MAX_ARTIFACT_SESSIONS: usize = 5;

/// Hard ceiling for the active-tasks and plans sections, as a fraction of
/// the total budget.
const SECTION_CAP_FRACTION: f64 = 0.15;

/// Pack build request.
#[derive(Debug, Clone)]
pub struct PackRequest {
    /// Token budget for the rendered pack.
    pub budget: usize,
    /// Output format.
    pub format: PackFormat,
    /// Requested mode; `Auto` infers from the latest session.
    pub mode: PackMode,
}

/// Loads active (pending / in-progress) todo and task items from the most
/// recent artifact files, sorted by priority (high > medium > low).
pub fn load_active_items(storage: &NdjsonStorage, max_sessions: usize) -> Vec<ActiveItem> {
    let mut items: Vec<ActiveItem> = Vec::new();

    for list in storage.list_todo_lists().into_iter().take(max_sessions) {
        for item in &list.items {
            if item.status.is_active() {
                items.push(ActiveItem {
                    kind: "todo".to_string(),
                    text: item.content.clone(),
                    status: item.status.as_str().to_string(),
                    priority: item.priority,
                    session_id: list.session_id.clone(),
                });
            }
        }
    }

    for session_id in storage.list_task_sessions().into_iter().take(max_sessions) {
        for task in storage.read_tasks(&session_id) {
            if task.status.is_active() {
                items.push(ActiveItem {
                    kind: "task".to_string(),
                    text: task.subject.clone(),
                    status: task.status.as_str().to_string(),
                    priority: Priority::Medium,
                    session_id: session_id.clone(),
                });
            }
        }
    }

    items.sort_by_key(|item| item.priority);
    items
}

/// Loads the N most recent plans with their content.
pub fn load_recent_plans(storage: &NdjsonStorage, max_plans: usize) -> Vec<PlanSummary> {
    storage
        .list_plans()
        .into_iter()
        .take(max_plans)
        .filter_map(|meta| {
            storage.read_plan(&meta.slug).map(|content| PlanSummary {
                slug: meta.slug,
                content,
            })
        })
        .collect()
}

/// Builds a context pack within the requested token budget.
pub fn build_pack(
    storage: &NdjsonStorage,
    client: &OllamaClient,
    request: &PackRequest,
) -> Result<String> {
    let config = storage.read_config()?;

    // Every session participates; skip ones already chunked.
    crate::chunker::chunk_all_sessions(storage, &config.chunking, false)?;

    let mode = match request.mode {
        PackMode::Auto => infer_mode(storage)?,
        explicit => explicit,
    };
    let profile = load_profile(&config, mode);

    // Debug mode pivots retrieval around the most recent failure.
    let (half_life_days, _) = effective_decay(&config);
    let excerpts: Vec<Chunk> = if mode == PackMode::Debug {
        match find_latest_error_session(storage)? {
            Some(failed) => {
                ContextualRetriever::default().retrieve_around_failure(storage, &failed)?
            }
            None => recency_retriever(half_life_days, config.dedup.near_threshold)
                .retrieve(storage)?,
        }
    } else {
        recency_retriever(half_life_days, config.dedup.near_threshold).retrieve(storage)?
    };

    let active_items = load_active_items(storage, MAX_ARTIFACT_SESSIONS);
    let plans = load_recent_plans(storage, MAX_PLANS);

    let state = crate::state_gen::load_or_generate_state(storage, client)?;

    match request.format {
        PackFormat::Xml => Ok(render_xml_budgeted(
            &state,
            &excerpts,
            &active_items,
            &plans,
            &profile,
            request.budget,
        )),
        PackFormat::Json | PackFormat::Markdown => Ok(render_with_excerpt_trim(
            request.format,
            &state,
            excerpts,
            &active_items,
            &plans,
            request.budget,
        )),
    }
}

fn recency_retriever(half_life_days: f64, near_threshold: f64) -> RecencyRetriever {
    RecencyRetriever {
        half_life_days,
        near_threshold,
        ..RecencyRetriever::default()
    }
}

/// Close tag per truncatable XML section, for element-level trimming.
fn close_tag_for(section: &str) -> Option<&'static str> {
    match section {
        "RECENT_CONTEXT_EXCERPTS" => Some("</EXCERPT>"),
        "ACTIVE_TASKS" => Some("/>"),
        "DECISIONS" => Some("</DECISION>"),
        "PLANS" => Some("</PLAN>"),
        _ => None,
    }
}

/// XML path: sections go through the budgeter with element-level truncation
/// so the envelope stays well-formed.
fn render_xml_budgeted(
    state: &ProjectState,
    excerpts: &[Chunk],
    active_items: &[ActiveItem],
    plans: &[PlanSummary],
    profile: &crate::pack_modes::BudgetProfile,
    budget: usize,
) -> String {
    let rendered = XmlRenderer::build_sections(state, excerpts, active_items, plans);

    let envelope_tokens = estimate_tokens(XML_ENVELOPE_OPEN) + estimate_tokens(XML_ENVELOPE_CLOSE);
    let inner_budget = budget.saturating_sub(envelope_tokens);
    let section_cap = (budget as f64 * SECTION_CAP_FRACTION) as usize;

    let fraction_of = |f: f64| (budget as f64 * f) as usize;
    let mut sections: Vec<Section> = Vec::new();
    for name in XML_SECTION_ORDER {
        let Some(content) = rendered.get(*name) else {
            continue;
        };
        let section = match *name {
            "PROJECT_STATE" | "CONSTRAINTS" | "INSTRUCTIONS" => {
                Section::protected(name, content.clone(), 0)
            }
            "DECISIONS" => Section::new(name, content.clone(), 1)
                .with_max_tokens(fraction_of(profile.decisions)),
            "ACTIVE_TASKS" => Section::new(name, content.clone(), 2)
                .with_max_tokens(fraction_of(profile.active_tasks).min(section_cap)),
            "PLANS" => Section::new(name, content.clone(), 3)
                .with_max_tokens(fraction_of(profile.plans).min(section_cap)),
            "RECENT_CONTEXT_EXCERPTS" => Section::new(name, content.clone(), 4)
                .with_max_tokens(fraction_of(profile.recent_context)),
            _ => Section::new(name, content.clone(), 5),
        };
        sections.push(section);
    }

    let allocated = apply_budget_with(&sections, inner_budget, |section, tokens| {
        match close_tag_for(&section.name) {
            Some(close_tag) => truncate_elements(&section.content, close_tag, tokens),
            None => String::new(),
        }
    });

    let mut final_sections = std::collections::BTreeMap::new();
    for section in allocated {
        final_sections.insert(section.name.clone(), section.content);
    }
    XmlRenderer::assemble(&final_sections)
}

/// JSON/Markdown path: render full, then drop excerpts from the tail until
/// the output fits.
fn render_with_excerpt_trim(
    format: PackFormat,
    state: &ProjectState,
    mut excerpts: Vec<Chunk>,
    active_items: &[ActiveItem],
    plans: &[PlanSummary],
    budget: usize,
) -> String {
    let renderer = renderer_for(format);
    let mut output = renderer.render(state, &excerpts, active_items, plans);
    let mut trimmed = false;
    while estimate_tokens(&output) > budget && !excerpts.is_empty() {
        excerpts.pop();
        output = renderer.render(state, &excerpts, active_items, plans);
        trimmed = true;
    }
    if trimmed {
        use std::io::Write;
        let _ = writeln!(
            std::io::stderr(),
            "Warning: Budget too small for full context. Some excerpts were dropped."
        );
    }
    output
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::core::models::{StateTask, TaskItem, TaskStatus, TodoItem, TodoList, TodoStatus};

    fn temp_storage() -> (tempfile::TempDir, NdjsonStorage) {
        let dir = tempfile::tempdir().unwrap();
        let (_, storage) = NdjsonStorage::init(dir.path().join(".memory-bank")).unwrap();
        (dir, storage)
    }

    fn todo(id: &str, content: &str, status: TodoStatus, priority: Priority) -> TodoItem {
        TodoItem {
            id: id.into(),
            content: content.into(),
            status,
            priority,
            active_form: None,
        }
    }

    #[test]
    fn test_load_active_items_empty_storage() {
        let (_dir, storage) = temp_storage();
        assert!(load_active_items(&storage, 5).is_empty());
    }

    #[test]
    fn test_load_active_items_filters_and_sorts() {
        let (_dir, storage) = temp_storage();
        storage
            .write_todo_list(&TodoList {
                session_id: "s1".into(),
                agent_id: None,
                items: vec![
                    todo("1", "urgent fix", TodoStatus::Pending, Priority::High),
                    todo("2", "done thing", TodoStatus::Completed, Priority::High),
                    todo("3", "ongoing work", TodoStatus::InProgress, Priority::Medium),
                    todo("4", "someday", TodoStatus::Pending, Priority::Low),
                ],
                file_path: String::new(),
                mtime: 0.0,
            })
            .unwrap();

        let items = load_active_items(&storage, 5);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].text, "urgent fix");
        assert_eq!(items[0].priority, Priority::High);
        assert_eq!(items[1].text, "ongoing work");
        assert_eq!(items[2].text, "someday");
    }

    #[test]
    fn test_load_active_items_includes_tasks() {
        let (_dir, storage) = temp_storage();
        storage
            .write_task(&TaskItem {
                id: "1".into(),
                session_id: "s2".into(),
                subject: "implement feature".into(),
                description: String::new(),
                active_form: None,
                status: TaskStatus::InProgress,
                blocks: vec![],
                blocked_by: vec![],
            })
            .unwrap();
        storage
            .write_task(&TaskItem {
                id: "2".into(),
                session_id: "s2".into(),
                subject: "finished feature".into(),
                description: String::new(),
                active_form: None,
                status: TaskStatus::Completed,
                blocks: vec![],
                blocked_by: vec![],
            })
            .unwrap();

        let items = load_active_items(&storage, 5);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, "task");
        assert_eq!(items[0].text, "implement feature");
        assert_eq!(items[0].status, "in_progress");
    }

    #[test]
    fn test_load_active_items_session_cap() {
        let (_dir, storage) = temp_storage();
        for i in 0..6 {
            storage
                .write_todo_list(&TodoList {
                    session_id: format!("s{i}"),
                    agent_id: None,
                    items: vec![todo("1", &format!("item {i}"), TodoStatus::Pending, Priority::Medium)],
                    file_path: String::new(),
                    mtime: 0.0,
                })
                .unwrap();
        }
        let items = load_active_items(&storage, 3);
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_load_recent_plans_limit() {
        let (_dir, storage) = temp_storage();
        for (i, slug) in ["one", "two", "three", "four"].iter().enumerate() {
            storage
                .write_plan(
                    &format!("# Plan {slug}"),
                    &crate::core::models::PlanMeta {
                        slug: (*slug).to_string(),
                        session_id: "s".into(),
                        timestamp: None,
                        file_path: String::new(),
                        mtime: i as f64,
                    },
                )
                .unwrap();
        }
        let plans = load_recent_plans(&storage, MAX_PLANS);
        assert_eq!(plans.len(), 3);
        assert!(plans[0].content.starts_with("# Plan"));
    }

    fn state_with_sections() -> ProjectState {
        ProjectState {
            summary: "A small summary.".into(),
            decisions: vec![],
            constraints: vec!["offline only".into()],
            tasks: vec![StateTask {
                id: "T1".into(),
                status: "pending".into(),
            }],
            updated_at: 0.0,
            source_sessions: vec!["s1".into()],
        }
    }

    fn excerpt(id: &str, text: &str) -> Chunk {
        Chunk {
            chunk_id: id.into(),
            session_id: "s1".into(),
            index: 0,
            text: text.into(),
            ts_start: 0.0,
            ts_end: 1.0,
            token_estimate: text.len() / 4,
            quality_score: 0.8,
            extra: std::collections::BTreeMap::new(),
        }
    }

    #[test]
    fn test_xml_budget_produces_well_formed_envelope_under_pressure() {
        let profile = crate::pack_modes::default_profile(PackMode::Auto);
        let excerpts: Vec<Chunk> = (0..50)
            .map(|i| excerpt(&format!("s1-{i}"), &format!("excerpt body number {i} with some length to it")))
            .collect();
        let output = render_xml_budgeted(&state_with_sections(), &excerpts, &[], &[], &profile, 300);
        assert!(output.starts_with("<MEMORY_BANK_CONTEXT version=\"1.0\">"));
        assert!(output.ends_with("</MEMORY_BANK_CONTEXT>"));
        // Protected sections survive whole.
        assert!(output.contains("A small summary."));
        assert!(output.contains("offline only"));
        assert!(output.contains("<INSTRUCTIONS>"));
        // Any surviving excerpts are whole elements.
        assert_eq!(
            output.matches("<EXCERPT").count(),
            output.matches("</EXCERPT>").count()
        );
        assert!(estimate_tokens(&output) <= 400);
    }

    #[test]
    fn test_xml_small_budget_still_well_formed() {
        let profile = crate::pack_modes::default_profile(PackMode::Auto);
        let excerpts = vec![excerpt("s1-0", &"long text ".repeat(200))];
        let output = render_xml_budgeted(&state_with_sections(), &excerpts, &[], &[], &profile, 50);
        assert!(output.starts_with("<MEMORY_BANK_CONTEXT"));
        assert!(output.ends_with("</MEMORY_BANK_CONTEXT>"));
    }

    #[test]
    fn test_json_trim_drops_tail_excerpts() {
        let excerpts: Vec<Chunk> = (0..30)
            .map(|i| excerpt(&format!("s1-{i}"), &format!("body {i} {}", "x".repeat(100))))
            .collect();
        let output = render_with_excerpt_trim(
            PackFormat::Json,
            &state_with_sections(),
            excerpts,
            &[],
            &[],
            400,
        );
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        let kept = value["recent_excerpts"].as_array().unwrap();
        assert!(kept.len() < 30);
        if let Some(first) = kept.first() {
            // Tail-dropping keeps the head of the list.
            assert_eq!(first["chunk_id"], "s1-0");
        }
        assert!(estimate_tokens(&output) <= 400);
    }

    #[test]
    fn test_markdown_trim_fits_budget() {
        let excerpts: Vec<Chunk> = (0..20)
            .map(|i| excerpt(&format!("s1-{i}"), &"words ".repeat(50)))
            .collect();
        let output = render_with_excerpt_trim(
            PackFormat::Markdown,
            &state_with_sections(),
            excerpts,
            &[],
            &[],
            300,
        );
        assert!(output.starts_with("# Memory Bank Context"));
        assert!(estimate_tokens(&output) <= 300);
    }
}
