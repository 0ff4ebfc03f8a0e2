//! Token budget allocation for context packs.
//!
//! Sections are abstract (name + content + priority); the budgeter allocates
//! tokens and truncates without knowing the output format. The XML path uses
//! [`truncate_elements`] instead of prefix truncation so that emitted markup
//! stays well-formed.

use std::io::Write;

/// Estimates token count: `chars / 4` with a 10% safety margin, rounded up.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    ((text.chars().count() as f64) / 4.0 * 1.1).ceil() as usize
}

/// A named content section with priority and budget metadata.
#[derive(Debug, Clone)]
pub struct Section {
    /// Section name (stable identifier).
    pub name: String,
    /// Rendered content.
    pub content: String,
    /// Lower number = higher priority = filled first.
    pub priority: u32,
    /// Protected sections are never shortened.
    pub is_protected: bool,
    /// Hard per-section cap, applied before allocation.
    pub max_tokens: Option<usize>,
}

impl Section {
    /// Creates a truncatable section.
    #[must_use]
    pub fn new(name: &str, content: String, priority: u32) -> Self {
        Self {
            name: name.to_string(),
            content,
            priority,
            is_protected: false,
            max_tokens: None,
        }
    }

    /// Creates a protected section.
    #[must_use]
    pub fn protected(name: &str, content: String, priority: u32) -> Self {
        Self {
            name: name.to_string(),
            content,
            priority,
            is_protected: true,
            max_tokens: None,
        }
    }

    /// Applies a hard token cap.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Estimated token cost of the current content.
    #[must_use]
    pub fn token_count(&self) -> usize {
        estimate_tokens(&self.content)
    }
}

/// Keeps the first `limit` chars of `text`.
fn char_prefix(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Removes trailing elements (identified by `close_tag`) until `content`
/// fits within `budget` tokens. Removes one element at a time from the end;
/// returns an empty string when nothing fits.
#[must_use]
pub fn truncate_elements(content: &str, close_tag: &str, budget: usize) -> String {
    let mut result = content.to_string();
    while estimate_tokens(&result) > budget {
        let Some(idx) = result.rfind(close_tag) else {
            return String::new();
        };
        let Some(line_start) = result[..idx].rfind('\n') else {
            return String::new();
        };
        let after_close = idx + close_tag.len();
        let rest = result[after_close..].to_string();
        result.truncate(line_start);
        result.push_str(&rest);
    }
    result
}

/// Allocates `budget` tokens across `sections`, truncating as needed.
///
/// Per-section `max_tokens` caps apply first. Protected sections are never
/// shortened; when their sum alone exceeds the budget a warning goes to
/// stderr and the remaining allocation clamps to zero. Non-protected
/// sections fill in ascending priority order; the first section that does
/// not fully fit keeps a character prefix sized from the remaining budget,
/// and everything after it empties.
#[must_use]
pub fn apply_budget(sections: &[Section], budget: usize) -> Vec<Section> {
    apply_budget_with(sections, budget, |section, tokens| {
        let char_limit = (tokens as f64 * 4.0 / 1.1) as usize;
        char_prefix(&section.content, char_limit)
    })
}

/// [`apply_budget`] with a caller-supplied truncation strategy, used by the
/// XML path to drop whole elements instead of cutting mid-markup. The
/// strategy receives the section and its remaining token allowance and
/// returns the shortened content.
pub fn apply_budget_with<F>(sections: &[Section], budget: usize, truncate: F) -> Vec<Section>
where
    F: Fn(&Section, usize) -> String,
{
    let mut sections: Vec<Section> = sections.to_vec();

    // Hard caps first, independent of priority.
    for section in &mut sections {
        if let Some(cap) = section.max_tokens {
            if section.token_count() > cap {
                let shortened = truncate(section, cap);
                section.content = shortened;
            }
        }
    }

    let total: usize = sections.iter().map(Section::token_count).sum();
    if total <= budget {
        return sections;
    }

    let protected_cost: usize = sections
        .iter()
        .filter(|s| s.is_protected)
        .map(Section::token_count)
        .sum();

    let mut available = budget.saturating_sub(protected_cost);
    if protected_cost > budget {
        warn(&format!(
            "Warning: Token budget ({budget}) too small for protected sections. Output truncated.\n"
        ));
        available = 0;
    }

    let mut order: Vec<usize> = (0..sections.len())
        .filter(|&i| !sections[i].is_protected)
        .collect();
    order.sort_by_key(|&i| sections[i].priority);

    let mut budget_left = available;
    let mut truncated = false;
    for &i in &order {
        let needed = sections[i].token_count();
        if needed <= budget_left {
            budget_left -= needed;
        } else if budget_left > 0 {
            let shortened = truncate(&sections[i], budget_left);
            sections[i].content = shortened;
            budget_left = 0;
            truncated = true;
        } else {
            sections[i].content = String::new();
            truncated = true;
        }
    }

    if truncated {
        warn("Warning: Budget too small for full context. Some sections were truncated.\n");
    }

    sections
}

fn warn(message: &str) {
    let _ = std::io::stderr().write_all(message.as_bytes());
}
