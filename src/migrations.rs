//! Schema versioning and migration for Memory Bank storage.
//!
//! v1 storage has no `schema_version` in config and may carry events
//! without `event_id`. The v1 -> v2 migration stamps the config and
//! backfills event ids via an atomic whole-file rewrite.

use std::fs;
use std::io::Write;

use serde_json::Value;

use crate::core::models::generate_event_id;
use crate::error::{MbError, Result};
use crate::index::{IndexEntry, VectorIndex};
use crate::ollama::OllamaClient;
use crate::storage::{NdjsonStorage, CURRENT_SCHEMA_VERSION};

/// Detects the schema version; a missing field means v1.
pub fn detect_version(storage: &NdjsonStorage) -> Result<u32> {
    let config = storage.read_config()?;
    Ok(config.schema_version.unwrap_or(1))
}

/// Runs all pending migrations. Returns `(old_version, new_version)`.
pub fn migrate(storage: &NdjsonStorage) -> Result<(u32, u32)> {
    let old_version = detect_version(storage)?;
    if old_version >= CURRENT_SCHEMA_VERSION {
        return Ok((old_version, old_version));
    }

    let mut current = old_version;
    if current == 1 {
        migrate_v1_to_v2(storage)?;
        current = 2;
    }

    Ok((old_version, current))
}

/// v1 -> v2: stamp `schema_version`, backfill `event_id` on every event.
fn migrate_v1_to_v2(storage: &NdjsonStorage) -> Result<()> {
    let mut config = storage.read_config()?;
    config.schema_version = Some(2);
    storage.write_config(&config)?;

    for session_dir in storage.session_dirs_sorted() {
        let events_path = session_dir.join("events.jsonl");
        if !events_path.exists() {
            continue;
        }

        let text = fs::read_to_string(&events_path)?;
        let mut lines: Vec<String> = Vec::new();
        let mut modified = false;
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut event: Value = serde_json::from_str(trimmed)?;
            let has_id = event
                .get("event_id")
                .and_then(Value::as_str)
                .is_some_and(|id| !id.is_empty());
            if !has_id {
                let session_id = event
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let ts = event.get("ts").and_then(Value::as_f64).unwrap_or(0.0);
                event["event_id"] = Value::String(generate_event_id(&session_id, ts));
                modified = true;
            }
            lines.push(serde_json::to_string(&event)?);
        }

        if modified {
            let parent = session_dir.as_path();
            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            let mut content = lines.join("\n");
            content.push('\n');
            tmp.write_all(content.as_bytes())?;
            tmp.persist(&events_path).map_err(|err| MbError::Io(err.error))?;
        }
    }

    tracing::info!("migrated storage from v1 to v2");
    Ok(())
}

/// Statistics from a reindex run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReindexStats {
    /// Chunks embedded.
    pub chunks: usize,
    /// Distinct sessions covered.
    pub sessions: usize,
}

/// Clears the embedding index and rebuilds it from every stored chunk.
pub fn reindex(storage: &NdjsonStorage, client: &OllamaClient) -> Result<ReindexStats> {
    let index_dir = storage.index_dir();
    fs::create_dir_all(&index_dir)?;
    let index = VectorIndex::new(&index_dir);
    index.clear()?;

    let mut chunks = 0usize;
    let mut sessions = std::collections::HashSet::new();

    for chunk in storage.all_chunks() {
        sessions.insert(chunk.session_id.clone());
        let vectors = client.embed(std::slice::from_ref(&chunk.text))?;
        if let Some(vector) = vectors.first() {
            index.add(vector, &IndexEntry::from_chunk(&chunk))?;
            chunks += 1;
        }
    }

    Ok(ReindexStats {
        chunks,
        sessions: sessions.len(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn temp_storage() -> (tempfile::TempDir, NdjsonStorage) {
        let dir = tempfile::tempdir().unwrap();
        let (_, storage) = NdjsonStorage::init(dir.path().join(".memory-bank")).unwrap();
        (dir, storage)
    }

    fn downgrade_to_v1(storage: &NdjsonStorage) {
        let mut config = storage.read_config().unwrap();
        config.schema_version = None;
        storage.write_config(&config).unwrap();
    }

    #[test]
    fn test_fresh_storage_is_current() {
        let (_dir, storage) = temp_storage();
        assert_eq!(detect_version(&storage).unwrap(), CURRENT_SCHEMA_VERSION);
        assert_eq!(migrate(&storage).unwrap(), (2, 2));
    }

    #[test]
    fn test_missing_schema_version_is_v1() {
        let (_dir, storage) = temp_storage();
        downgrade_to_v1(&storage);
        assert_eq!(detect_version(&storage).unwrap(), 1);
    }

    #[test]
    fn test_migrate_v1_to_v2_backfills_event_ids() {
        let (_dir, storage) = temp_storage();
        let meta = storage
            .create_session(&["x".to_string()], "/tmp", None, true)
            .unwrap();

        // Write a v1-era event line without event_id.
        let events_path = storage
            .sessions_dir()
            .join(&meta.session_id)
            .join("events.jsonl");
        fs::write(
            &events_path,
            format!(
                "{}\n",
                serde_json::json!({
                    "ts": 1.5,
                    "session_id": meta.session_id,
                    "stream": "stdout",
                    "role": "terminal",
                    "content": "old event",
                })
            ),
        )
        .unwrap();
        downgrade_to_v1(&storage);

        let (old, new) = migrate(&storage).unwrap();
        assert_eq!((old, new), (1, 2));

        let events = storage.read_events(&meta.session_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, generate_event_id(&meta.session_id, 1.5));

        // And the raw file carries the id now.
        let raw = fs::read_to_string(&events_path).unwrap();
        assert!(raw.contains("event_id"));
    }

    #[test]
    fn test_migrate_idempotent() {
        let (_dir, storage) = temp_storage();
        downgrade_to_v1(&storage);
        migrate(&storage).unwrap();
        assert_eq!(migrate(&storage).unwrap(), (2, 2));
    }
}
