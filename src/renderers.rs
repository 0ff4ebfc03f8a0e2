//! Context pack renderers: XML, JSON, and Markdown over one section model.
//!
//! All three renderers consume the same inputs (project state, excerpts,
//! active artifact items, recent plans) and carry the same logical content;
//! `test_renderers_carry_same_content` pins that equivalence.

use std::collections::BTreeMap;

use serde_json::json;

use crate::core::models::{Chunk, PackFormat, ProjectState};
use crate::core::Priority;

/// Fixed instruction line appended to every pack.
pub const INSTRUCTIONS: &str = "Paste this into a fresh LLM session to restore context.";

/// An active todo/task item loaded from artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveItem {
    /// `todo` or `task`.
    pub kind: String,
    /// Item text (todo content or task subject).
    pub text: String,
    /// Lifecycle status string.
    pub status: String,
    /// Item priority.
    pub priority: Priority,
    /// Owning session.
    pub session_id: String,
}

/// A recent plan, trimmed for pack inclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    /// Plan slug.
    pub slug: String,
    /// Plan content (possibly truncated upstream).
    pub content: String,
}

/// Renders structured pack data into one output format.
pub trait Renderer {
    /// Produces the full pack text.
    fn render(
        &self,
        state: &ProjectState,
        excerpts: &[Chunk],
        active_items: &[ActiveItem],
        plans: &[PlanSummary],
    ) -> String;
}

/// Factory for the format-specific renderer.
#[must_use]
pub fn renderer_for(format: PackFormat) -> Box<dyn Renderer> {
    match format {
        PackFormat::Xml => Box::new(XmlRenderer),
        PackFormat::Json => Box::new(JsonRenderer),
        PackFormat::Markdown => Box::new(MarkdownRenderer),
    }
}

fn generated_at() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Escapes XML text and attribute content.
fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// XML
// ---------------------------------------------------------------------------

/// XML envelope renderer (the default pack format).
#[derive(Debug, Clone, Copy)]
pub struct XmlRenderer;

/// Envelope section order. `PLANS` appears only when non-empty.
pub const XML_SECTION_ORDER: &[&str] = &[
    "PROJECT_STATE",
    "DECISIONS",
    "CONSTRAINTS",
    "ACTIVE_TASKS",
    "PLANS",
    "RECENT_CONTEXT_EXCERPTS",
    "INSTRUCTIONS",
];

/// Envelope opening line.
pub const XML_ENVELOPE_OPEN: &str = "<MEMORY_BANK_CONTEXT version=\"1.0\">\n";
/// Envelope closing line.
pub const XML_ENVELOPE_CLOSE: &str = "\n</MEMORY_BANK_CONTEXT>";

impl XmlRenderer {
    /// Builds each named section's markup; the pack builder feeds these to
    /// the budgeter before final assembly.
    #[must_use]
    pub fn build_sections(
        state: &ProjectState,
        excerpts: &[Chunk],
        active_items: &[ActiveItem],
        plans: &[PlanSummary],
    ) -> BTreeMap<String, String> {
        let mut sections = BTreeMap::new();

        let source = state.source_sessions.join(", ");
        sections.insert(
            "PROJECT_STATE".to_string(),
            format!(
                "  <PROJECT_STATE>\n    <GENERATED_AT>{}</GENERATED_AT>\n    <SOURCE_SESSIONS>{}</SOURCE_SESSIONS>\n    <SUMMARY>{}</SUMMARY>\n  </PROJECT_STATE>",
                generated_at(),
                xml_escape(&source),
                xml_escape(&state.summary),
            ),
        );

        if state.decisions.is_empty() {
            sections.insert("DECISIONS".to_string(), "  <DECISIONS/>".to_string());
        } else {
            let items: Vec<String> = state
                .decisions
                .iter()
                .map(|d| {
                    format!(
                        "    <DECISION id=\"{}\">\n      <STATEMENT>{}</STATEMENT>\n      <RATIONALE>{}</RATIONALE>\n    </DECISION>",
                        xml_escape(&d.id),
                        xml_escape(&d.statement),
                        xml_escape(&d.rationale),
                    )
                })
                .collect();
            sections.insert(
                "DECISIONS".to_string(),
                format!("  <DECISIONS>\n{}\n  </DECISIONS>", items.join("\n")),
            );
        }

        if state.constraints.is_empty() {
            sections.insert("CONSTRAINTS".to_string(), "  <CONSTRAINTS/>".to_string());
        } else {
            let items: Vec<String> = state
                .constraints
                .iter()
                .map(|c| format!("    <CONSTRAINT>{}</CONSTRAINT>", xml_escape(c)))
                .collect();
            sections.insert(
                "CONSTRAINTS".to_string(),
                format!("  <CONSTRAINTS>\n{}\n  </CONSTRAINTS>", items.join("\n")),
            );
        }

        if state.tasks.is_empty() && active_items.is_empty() {
            sections.insert("ACTIVE_TASKS".to_string(), "  <ACTIVE_TASKS/>".to_string());
        } else {
            let mut items: Vec<String> = state
                .tasks
                .iter()
                .map(|t| {
                    format!(
                        "    <TASK id=\"{}\" status=\"{}\"/>",
                        xml_escape(&t.id),
                        xml_escape(&t.status),
                    )
                })
                .collect();
            items.extend(active_items.iter().map(|item| {
                format!(
                    "    <ITEM kind=\"{}\" status=\"{}\" priority=\"{}\" text=\"{}\"/>",
                    xml_escape(&item.kind),
                    xml_escape(&item.status),
                    item.priority,
                    xml_escape(&item.text),
                )
            }));
            sections.insert(
                "ACTIVE_TASKS".to_string(),
                format!("  <ACTIVE_TASKS>\n{}\n  </ACTIVE_TASKS>", items.join("\n")),
            );
        }

        if !plans.is_empty() {
            let items: Vec<String> = plans
                .iter()
                .map(|p| {
                    format!(
                        "    <PLAN slug=\"{}\">\n      {}\n    </PLAN>",
                        xml_escape(&p.slug),
                        xml_escape(&p.content),
                    )
                })
                .collect();
            sections.insert(
                "PLANS".to_string(),
                format!("  <PLANS>\n{}\n  </PLANS>", items.join("\n")),
            );
        }

        if excerpts.is_empty() {
            sections.insert(
                "RECENT_CONTEXT_EXCERPTS".to_string(),
                "  <RECENT_CONTEXT_EXCERPTS/>".to_string(),
            );
        } else {
            let items: Vec<String> = excerpts
                .iter()
                .map(|ex| {
                    format!(
                        "    <EXCERPT chunk_id=\"{}\" ts_end=\"{}\">\n      {}\n    </EXCERPT>",
                        xml_escape(&ex.chunk_id),
                        ex.ts_end,
                        xml_escape(&ex.text),
                    )
                })
                .collect();
            sections.insert(
                "RECENT_CONTEXT_EXCERPTS".to_string(),
                format!(
                    "  <RECENT_CONTEXT_EXCERPTS>\n{}\n  </RECENT_CONTEXT_EXCERPTS>",
                    items.join("\n")
                ),
            );
        }

        sections.insert(
            "INSTRUCTIONS".to_string(),
            format!("  <INSTRUCTIONS>{INSTRUCTIONS}</INSTRUCTIONS>"),
        );

        sections
    }

    /// Assembles sections into the envelope in canonical order.
    #[must_use]
    pub fn assemble(sections: &BTreeMap<String, String>) -> String {
        let mut parts = vec![XML_ENVELOPE_OPEN.to_string()];
        for name in XML_SECTION_ORDER {
            if let Some(content) = sections.get(*name) {
                if !content.is_empty() {
                    parts.push(content.clone());
                }
            }
        }
        parts.push(XML_ENVELOPE_CLOSE.to_string());
        parts.join("\n")
    }
}

impl Renderer for XmlRenderer {
    fn render(
        &self,
        state: &ProjectState,
        excerpts: &[Chunk],
        active_items: &[ActiveItem],
        plans: &[PlanSummary],
    ) -> String {
        let sections = Self::build_sections(state, excerpts, active_items, plans);
        Self::assemble(&sections)
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// Single-object JSON renderer.
#[derive(Debug, Clone, Copy)]
pub struct JsonRenderer;

impl Renderer for JsonRenderer {
    fn render(
        &self,
        state: &ProjectState,
        excerpts: &[Chunk],
        active_items: &[ActiveItem],
        plans: &[PlanSummary],
    ) -> String {
        let mut active_tasks: Vec<serde_json::Value> = state
            .tasks
            .iter()
            .map(|t| json!({"id": t.id, "status": t.status}))
            .collect();
        active_tasks.extend(active_items.iter().map(|item| {
            json!({
                "type": item.kind,
                "text": item.text,
                "status": item.status,
                "priority": item.priority.as_str(),
                "session_id": item.session_id,
            })
        }));

        let mut result = json!({
            "version": "1.0",
            "project_state": {
                "generated_at": generated_at(),
                "source_sessions": state.source_sessions,
                "summary": state.summary,
            },
            "decisions": state.decisions,
            "constraints": state.constraints,
            "active_tasks": active_tasks,
            "recent_excerpts": excerpts
                .iter()
                .map(|ex| json!({
                    "chunk_id": ex.chunk_id,
                    "ts_end": ex.ts_end,
                    "text": ex.text,
                }))
                .collect::<Vec<_>>(),
            "instructions": INSTRUCTIONS,
        });

        if !plans.is_empty() {
            result["plans"] = serde_json::Value::Array(
                plans
                    .iter()
                    .map(|p| json!({"slug": p.slug, "content": p.content}))
                    .collect(),
            );
        }

        serde_json::to_string_pretty(&result).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Markdown
// ---------------------------------------------------------------------------

/// Markdown renderer.
#[derive(Debug, Clone, Copy)]
pub struct MarkdownRenderer;

impl Renderer for MarkdownRenderer {
    fn render(
        &self,
        state: &ProjectState,
        excerpts: &[Chunk],
        active_items: &[ActiveItem],
        plans: &[PlanSummary],
    ) -> String {
        let mut lines: Vec<String> = Vec::new();
        lines.push("# Memory Bank Context".to_string());
        lines.push(String::new());

        lines.push("## Project State".to_string());
        lines.push(format!("**Generated**: {}", generated_at()));
        lines.push(format!("**Sources**: {}", state.source_sessions.join(", ")));
        lines.push(String::new());
        lines.push(state.summary.clone());
        lines.push(String::new());

        lines.push("## Decisions".to_string());
        if state.decisions.is_empty() {
            lines.push("No decisions recorded.".to_string());
        } else {
            for d in &state.decisions {
                lines.push(format!("- **{}**: {} — *{}*", d.id, d.statement, d.rationale));
            }
        }
        lines.push(String::new());

        lines.push("## Constraints".to_string());
        if state.constraints.is_empty() {
            lines.push("No constraints recorded.".to_string());
        } else {
            for c in &state.constraints {
                lines.push(format!("- {c}"));
            }
        }
        lines.push(String::new());

        lines.push("## Active Tasks".to_string());
        if state.tasks.is_empty() && active_items.is_empty() {
            lines.push("No active tasks.".to_string());
        } else {
            for t in &state.tasks {
                lines.push(format!("- **{}**: {}", t.id, t.status));
            }
            for item in active_items {
                lines.push(format!(
                    "- [{}] {} ({}, {})",
                    item.kind, item.text, item.status, item.priority
                ));
            }
        }
        lines.push(String::new());

        if !plans.is_empty() {
            lines.push("## Plans".to_string());
            for p in plans {
                lines.push(format!("### {}", p.slug));
                lines.push(p.content.clone());
                lines.push(String::new());
            }
        }

        lines.push("## Recent Context".to_string());
        if excerpts.is_empty() {
            lines.push("No recent context available.".to_string());
            lines.push(String::new());
        } else {
            for ex in excerpts {
                let duration = if ex.ts_start > 0.0 {
                    ex.ts_end - ex.ts_start
                } else {
                    0.0
                };
                let minutes = (duration / 60.0) as u64;
                let seconds = (duration % 60.0) as u64;
                lines.push(format!("### {} ({minutes:02}:{seconds:02})", ex.session_id));
                lines.push(ex.text.clone());
                lines.push(String::new());
            }
        }

        lines.push("---".to_string());
        lines.push(format!("*{INSTRUCTIONS}*"));

        lines.join("\n")
    }
}
