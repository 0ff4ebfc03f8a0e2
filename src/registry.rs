//! Global project registry: `~/.memory-bank/projects.json`.
//!
//! The only process-wide state in the system. A small file-backed store
//! with atomic whole-file replacement and no in-process caching; a corrupt
//! or missing file reads as empty.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::models::ProjectEntry;
use crate::error::Result;
use crate::storage::now_epoch;

/// Registry format version.
pub const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    #[serde(default)]
    projects: BTreeMap<String, ProjectEntry>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            projects: BTreeMap::new(),
        }
    }
}

/// Registry directory, overridable for tests via `$HOME`.
fn registry_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memory-bank")
}

fn registry_path() -> PathBuf {
    registry_dir().join("projects.json")
}

fn read_registry() -> RegistryFile {
    fs::read_to_string(registry_path())
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

fn write_registry(data: &RegistryFile) -> Result<()> {
    let dir = registry_dir();
    fs::create_dir_all(&dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    let mut text = serde_json::to_string_pretty(data)?;
    text.push('\n');
    tmp.write_all(text.as_bytes())?;
    tmp.persist(registry_path())
        .map_err(|err| crate::error::MbError::Io(err.error))?;
    Ok(())
}

fn resolve(path: &str) -> String {
    Path::new(path)
        .canonicalize()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Registers a project path. Idempotent: an existing entry keeps its stats.
pub fn register_project(path: &str) -> Result<ProjectEntry> {
    let resolved = resolve(path);
    let mut data = read_registry();

    if let Some(existing) = data.projects.get(&resolved) {
        return Ok(existing.clone());
    }

    let entry = ProjectEntry {
        registered_at: now_epoch(),
        last_import: 0.0,
        session_count: 0,
    };
    data.projects.insert(resolved, entry.clone());
    write_registry(&data)?;
    Ok(entry)
}

/// All registered projects as `(path, entry)`, in path order.
#[must_use]
pub fn list_projects() -> Vec<(String, ProjectEntry)> {
    read_registry().projects.into_iter().collect()
}

/// Removes a project. Returns false when it was not registered.
pub fn remove_project(path: &str) -> Result<bool> {
    let resolved = resolve(path);
    let mut data = read_registry();
    if data.projects.remove(&resolved).is_none() {
        return Ok(false);
    }
    write_registry(&data)?;
    Ok(true)
}

/// Stamps `last_import` and the session count for a project, registering it
/// first if needed.
pub fn update_project_stats(path: &str, session_count: usize) -> Result<()> {
    let resolved = resolve(path);
    let mut data = read_registry();

    let entry = data.projects.entry(resolved).or_insert_with(|| ProjectEntry {
        registered_at: now_epoch(),
        last_import: 0.0,
        session_count: 0,
    });
    entry.last_import = now_epoch();
    entry.session_count = session_count;

    write_registry(&data)
}
