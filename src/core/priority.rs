//! Priority level for todo and task items.
//!
//! This type lives in `core` so that retrieval, rendering, and the CLI can
//! share it without duplicating the ordering logic.

use serde::{Deserialize, Serialize};

/// Priority of a todo/task item, ordered from highest to lowest.
///
/// Discriminants are inverted (`High = 0`, `Low = 2`) so that the derived
/// [`Ord`] implementation sorts high-priority items first. Active-item
/// loading in the pack builder relies on this: a plain `sort_by_key` yields
/// high > medium > low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Must happen before anything else.
    High = 0,
    /// Default priority.
    Medium = 1,
    /// Nice to have.
    Low = 2,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl Priority {
    /// Parses a priority string (case-insensitive). Unknown values map to
    /// [`Priority::Medium`], matching the lenient artifact-file readers.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }

    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
