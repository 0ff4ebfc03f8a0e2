//! Pack modes: budget profiles, mode inference, and config overrides.
//!
//! Four modes (auto/debug/build/explore) decide how the token budget splits
//! across pack sections. Config overrides merge per-key over the built-in
//! defaults and the result renormalizes to 1.0.

use crate::error::Result;
use crate::graph::{EpisodeType, SessionGraph};
use crate::storage::{Config, NdjsonStorage};

/// Context pack generation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackMode {
    /// Infer from the most recent session.
    #[default]
    Auto,
    /// Failure-centric: most of the budget goes to recent context.
    Debug,
    /// Feature work: balanced toward decisions, tasks, and plans.
    Build,
    /// Understanding: weighted toward project state.
    Explore,
}

impl PackMode {
    /// String tag used in CLI flags and config keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Debug => "debug",
            Self::Build => "build",
            Self::Explore => "explore",
        }
    }

    /// Parses a mode tag (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "debug" => Some(Self::Debug),
            "build" => Some(Self::Build),
            "explore" => Some(Self::Explore),
            _ => None,
        }
    }
}

impl std::fmt::Display for PackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fractional allocation of the budget across pack sections. All values in
/// `[0, 1]`, summing to 1.0 after [`BudgetProfile::normalized`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetProfile {
    /// Project state summary.
    pub project_state: f64,
    /// Decisions list.
    pub decisions: f64,
    /// Active todos/tasks.
    pub active_tasks: f64,
    /// Recent plans.
    pub plans: f64,
    /// Recent context excerpts.
    pub recent_context: f64,
}

impl BudgetProfile {
    /// Scales the fractions to sum to exactly 1.0. A non-positive total
    /// falls back to the auto profile.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let total = self.project_state
            + self.decisions
            + self.active_tasks
            + self.plans
            + self.recent_context;
        if total <= 0.0 {
            return default_profile(PackMode::Auto);
        }
        if (total - 1.0).abs() < 1e-9 {
            return *self;
        }
        Self {
            project_state: self.project_state / total,
            decisions: self.decisions / total,
            active_tasks: self.active_tasks / total,
            plans: self.plans / total,
            recent_context: self.recent_context / total,
        }
    }

    fn field(&self, key: &str) -> Option<f64> {
        match key {
            "project_state" => Some(self.project_state),
            "decisions" => Some(self.decisions),
            "active_tasks" => Some(self.active_tasks),
            "plans" => Some(self.plans),
            "recent_context" => Some(self.recent_context),
            _ => None,
        }
    }

    fn with_field(mut self, key: &str, value: f64) -> Self {
        match key {
            "project_state" => self.project_state = value,
            "decisions" => self.decisions = value,
            "active_tasks" => self.active_tasks = value,
            "plans" => self.plans = value,
            "recent_context" => self.recent_context = value,
            _ => {}
        }
        self
    }
}

/// Built-in budget profiles, the authoritative defaults.
#[must_use]
pub fn default_profile(mode: PackMode) -> BudgetProfile {
    match mode {
        PackMode::Auto => BudgetProfile {
            project_state: 0.15,
            decisions: 0.15,
            active_tasks: 0.15,
            plans: 0.15,
            recent_context: 0.40,
        },
        PackMode::Debug => BudgetProfile {
            project_state: 0.10,
            decisions: 0.05,
            active_tasks: 0.05,
            plans: 0.05,
            recent_context: 0.75,
        },
        PackMode::Build => BudgetProfile {
            project_state: 0.15,
            decisions: 0.20,
            active_tasks: 0.20,
            plans: 0.20,
            recent_context: 0.25,
        },
        PackMode::Explore => BudgetProfile {
            project_state: 0.25,
            decisions: 0.15,
            active_tasks: 0.05,
            plans: 0.15,
            recent_context: 0.40,
        },
    }
}

/// Episode-to-mode mapping.
#[must_use]
pub fn mode_for_episode(episode: EpisodeType) -> PackMode {
    match episode {
        EpisodeType::Debug => PackMode::Debug,
        EpisodeType::Build
        | EpisodeType::Refactor
        | EpisodeType::Config
        | EpisodeType::Test
        | EpisodeType::Deploy => PackMode::Build,
        EpisodeType::Explore | EpisodeType::Docs | EpisodeType::Review => PackMode::Explore,
    }
}

/// Returns the profile for `mode`, merging any `pack_modes` config
/// overrides per-key over the built-in default and renormalizing.
#[must_use]
pub fn load_profile(config: &Config, mode: PackMode) -> BudgetProfile {
    let default = default_profile(mode);
    let Some(overrides) = config
        .pack_modes
        .as_ref()
        .and_then(|modes| modes.get(mode.as_str()))
    else {
        return default;
    };
    if overrides.is_empty() {
        return default;
    }

    let mut merged = default;
    for key in ["project_state", "decisions", "active_tasks", "plans", "recent_context"] {
        if let Some(&value) = overrides.get(key) {
            merged = merged.with_field(key, value);
        }
    }
    merged.normalized()
}

/// Infers the pack mode from the most recent session's episode type.
/// Returns [`PackMode::Auto`] when no sessions exist.
pub fn infer_mode(storage: &NdjsonStorage) -> Result<PackMode> {
    let sessions = storage.list_sessions();
    let Some(latest) = sessions.first() else {
        return Ok(PackMode::Auto);
    };

    let chunks = storage.read_chunks(&latest.session_id)?;
    let episode = SessionGraph::new().classify_episode(latest, &chunks);
    Ok(mode_for_episode(episode))
}

/// The most recent session with an error, if any. Sessions come back
/// newest-first from storage, so the first hit wins.
pub fn find_latest_error_session(storage: &NdjsonStorage) -> Result<Option<String>> {
    let graph = SessionGraph::new();
    for meta in storage.list_sessions() {
        let chunks = storage.read_chunks(&meta.session_id)?;
        if graph.detect_error(&meta, &chunks) {
            return Ok(Some(meta.session_id));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::BTreeMap;

    fn sum(p: &BudgetProfile) -> f64 {
        p.project_state + p.decisions + p.active_tasks + p.plans + p.recent_context
    }

    #[test]
    fn test_default_profiles_sum_to_one() {
        for mode in [PackMode::Auto, PackMode::Debug, PackMode::Build, PackMode::Explore] {
            assert!((sum(&default_profile(mode)) - 1.0).abs() < 1e-9, "{mode}");
        }
    }

    #[test]
    fn test_authoritative_defaults() {
        let debug = default_profile(PackMode::Debug);
        assert!((debug.recent_context - 0.75).abs() < 1e-9);
        assert!((debug.decisions - 0.05).abs() < 1e-9);
        let auto = default_profile(PackMode::Auto);
        assert!((auto.recent_context - 0.40).abs() < 1e-9);
        let build = default_profile(PackMode::Build);
        assert!((build.plans - 0.20).abs() < 1e-9);
        let explore = default_profile(PackMode::Explore);
        assert!((explore.project_state - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_normalized_rescales() {
        let profile = BudgetProfile {
            project_state: 0.2,
            decisions: 0.2,
            active_tasks: 0.2,
            plans: 0.2,
            recent_context: 0.4,
        };
        let normalized = profile.normalized();
        assert!((sum(&normalized) - 1.0).abs() < 1e-9);
        assert!((normalized.recent_context - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalized_zero_falls_back_to_auto() {
        let zero = BudgetProfile {
            project_state: 0.0,
            decisions: 0.0,
            active_tasks: 0.0,
            plans: 0.0,
            recent_context: 0.0,
        };
        assert_eq!(zero.normalized(), default_profile(PackMode::Auto));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(PackMode::parse("DEBUG"), Some(PackMode::Debug));
        assert_eq!(PackMode::parse("auto"), Some(PackMode::Auto));
        assert_eq!(PackMode::parse("nope"), None);
    }

    #[test]
    fn test_episode_to_mode_map() {
        assert_eq!(mode_for_episode(EpisodeType::Debug), PackMode::Debug);
        for e in [
            EpisodeType::Build,
            EpisodeType::Refactor,
            EpisodeType::Config,
            EpisodeType::Test,
            EpisodeType::Deploy,
        ] {
            assert_eq!(mode_for_episode(e), PackMode::Build);
        }
        for e in [EpisodeType::Explore, EpisodeType::Docs, EpisodeType::Review] {
            assert_eq!(mode_for_episode(e), PackMode::Explore);
        }
    }

    #[test]
    fn test_load_profile_merges_and_renormalizes() {
        let mut config = Config::default();
        let mut overrides = BTreeMap::new();
        let mut debug_overrides = BTreeMap::new();
        debug_overrides.insert("recent_context".to_string(), 0.9);
        overrides.insert("debug".to_string(), debug_overrides);
        config.pack_modes = Some(overrides);

        let profile = load_profile(&config, PackMode::Debug);
        assert!((sum(&profile) - 1.0).abs() < 1e-9);
        // 0.9 merged over {0.10, 0.05, 0.05, 0.05} then renormalized.
        assert!(profile.recent_context > 0.75);
        // Untouched keys keep their relative defaults.
        assert!((profile.project_state / profile.decisions - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_profile_without_overrides_is_default() {
        let config = Config::default();
        assert_eq!(load_profile(&config, PackMode::Build), default_profile(PackMode::Build));
    }

    #[test]
    fn test_infer_mode_empty_storage_is_auto() {
        let dir = tempfile::tempdir().unwrap();
        let (_, storage) =
            crate::storage::NdjsonStorage::init(dir.path().join(".memory-bank")).unwrap();
        assert_eq!(infer_mode(&storage).unwrap(), PackMode::Auto);
    }

    #[test]
    fn test_infer_mode_from_latest_session() {
        let dir = tempfile::tempdir().unwrap();
        let (_, storage) =
            crate::storage::NdjsonStorage::init(dir.path().join(".memory-bank")).unwrap();
        storage
            .create_session(&["pytest".to_string()], "/tmp", None, true)
            .unwrap();
        // test episode maps to build mode
        assert_eq!(infer_mode(&storage).unwrap(), PackMode::Build);
    }

    #[test]
    fn test_find_latest_error_session() {
        let dir = tempfile::tempdir().unwrap();
        let (_, storage) =
            crate::storage::NdjsonStorage::init(dir.path().join(".memory-bank")).unwrap();
        assert!(find_latest_error_session(&storage).unwrap().is_none());

        let ok = storage
            .create_session(&["make".to_string()], "/tmp", None, true)
            .unwrap();
        storage.finalize_session(&ok.session_id, Some(0)).unwrap();

        let failed = storage
            .create_session(&["make".to_string()], "/tmp", None, true)
            .unwrap();
        storage.finalize_session(&failed.session_id, Some(2)).unwrap();

        let found = find_latest_error_session(&storage).unwrap();
        assert_eq!(found, Some(failed.session_id));
    }
}
