//! Source/Processor pipeline for unified ingestion.
//!
//! Sources produce sessions (PTY capture, hook transcripts, retroactive
//! import); processors post-process them in configured order (chunking,
//! embedding). The CLI wires concrete pipelines; this module holds the
//! trait seams and the adapters.

use std::fs;
use std::path::{Path, PathBuf};

use crate::artifacts;
use crate::chunker::chunk_session;
use crate::core::models::{Chunk, EventSource, PlanMeta, TaskItem, TodoItem, TodoList};
use crate::error::Result;
use crate::index::build_index;
use crate::ollama::OllamaClient;
use crate::storage::{file_mtime_epoch, now_epoch, HookSessionEntry, NdjsonStorage};
use crate::transcript;

/// An ingestion source that creates or updates sessions.
pub trait Source {
    /// Creates/updates sessions and returns their ids.
    fn ingest(&mut self, storage: &NdjsonStorage) -> Result<Vec<String>>;
}

/// A post-processor over freshly ingested sessions.
pub trait Processor {
    /// Processes the given sessions.
    fn process(&self, storage: &NdjsonStorage, session_ids: &[String]) -> Result<()>;
}

/// Runs a sequence of processors in order.
#[derive(Default)]
pub struct ProcessorPipeline {
    processors: Vec<Box<dyn Processor>>,
}

impl ProcessorPipeline {
    /// Creates a pipeline over the given processors.
    #[must_use]
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self {
        Self { processors }
    }

    /// Runs every processor over the session list.
    pub fn run(&self, storage: &NdjsonStorage, session_ids: &[String]) -> Result<()> {
        for processor in &self.processors {
            processor.process(storage, session_ids)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Processors
// ---------------------------------------------------------------------------

/// Generates chunks from session events.
#[derive(Debug, Default)]
pub struct ChunkProcessor {
    /// Re-chunk sessions that already have chunks.
    pub force: bool,
}

impl Processor for ChunkProcessor {
    fn process(&self, storage: &NdjsonStorage, session_ids: &[String]) -> Result<()> {
        let config = storage.read_config()?;
        for session_id in session_ids {
            if storage.has_chunks(session_id) && !self.force {
                continue;
            }
            chunk_session(storage, session_id, &config.chunking)?;
        }
        Ok(())
    }
}

/// Builds the embedding index for session chunks.
pub struct EmbedProcessor {
    client: OllamaClient,
}

impl EmbedProcessor {
    /// Creates the processor with an embedding client.
    #[must_use]
    pub fn new(client: OllamaClient) -> Self {
        Self { client }
    }
}

impl Processor for EmbedProcessor {
    fn process(&self, storage: &NdjsonStorage, _session_ids: &[String]) -> Result<()> {
        build_index(storage, &self.client)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// PTY source: runs a command under the supervisor and captures events.
#[cfg(unix)]
#[derive(Debug)]
pub struct PtySource {
    child_cmd: Vec<String>,
    /// Child exit code after ingestion.
    pub exit_code: i32,
    /// Created session id after ingestion.
    pub session_id: String,
}

#[cfg(unix)]
impl PtySource {
    /// Creates a source for the given argv.
    #[must_use]
    pub fn new(child_cmd: Vec<String>) -> Self {
        Self {
            child_cmd,
            exit_code: 1,
            session_id: String::new(),
        }
    }
}

#[cfg(unix)]
impl Source for PtySource {
    fn ingest(&mut self, storage: &NdjsonStorage) -> Result<Vec<String>> {
        let (exit_code, session_id) = crate::capture::run_session(storage, &self.child_cmd)?;
        self.exit_code = exit_code;
        self.session_id = session_id.clone();
        Ok(vec![session_id])
    }
}

/// Hook source: processes one external-CLI transcript delivered by a Stop
/// hook payload. Re-processing an unchanged transcript is a no-op; a grown
/// transcript rewrites the session's chunks wholesale.
#[derive(Debug)]
pub struct HookSource {
    transcript_path: String,
    cwd: String,
    claude_session_id: String,
}

impl HookSource {
    /// Creates a source from a hook payload.
    #[must_use]
    pub fn new(transcript_path: String, cwd: String, claude_session_id: String) -> Self {
        Self {
            transcript_path,
            cwd,
            claude_session_id,
        }
    }
}

impl Source for HookSource {
    fn ingest(&mut self, storage: &NdjsonStorage) -> Result<Vec<String>> {
        let transcript_file = Path::new(&self.transcript_path);
        let Ok(file_meta) = fs::metadata(transcript_file) else {
            return Ok(Vec::new());
        };
        let transcript_size = file_meta.len();
        if transcript_size == 0 {
            return Ok(Vec::new());
        }

        let mut state = storage.load_hooks_state()?;
        let session_id = match state.sessions.get(&self.claude_session_id) {
            Some(entry) => {
                if entry.transcript_size == transcript_size {
                    // Transcript unchanged since last processing.
                    return Ok(Vec::new());
                }
                entry.mb_session_id.clone()
            }
            None => {
                let meta = storage.create_session(
                    &["claude".to_string()],
                    &self.cwd,
                    Some(EventSource::Hook),
                    false,
                )?;
                state.sessions.insert(
                    self.claude_session_id.clone(),
                    HookSessionEntry {
                        mb_session_id: meta.session_id.clone(),
                        transcript_path: self.transcript_path.clone(),
                        transcript_size,
                        last_processed: now_epoch(),
                    },
                );
                meta.session_id
            }
        };

        let turns = transcript::extract_turns(transcript_file);
        if turns.is_empty() {
            storage.save_hooks_state(&state)?;
            return Ok(Vec::new());
        }

        let config = storage.read_config()?;
        let chunks = transcript::chunks_from_turns(&turns, &session_id, &config.chunking);
        if chunks.is_empty() {
            storage.save_hooks_state(&state)?;
            return Ok(Vec::new());
        }

        storage.write_chunks(&session_id, &chunks)?;
        storage.finalize_session(&session_id, None)?;

        if let Some(entry) = state.sessions.get_mut(&self.claude_session_id) {
            entry.transcript_size = transcript_size;
            entry.last_processed = now_epoch();
        }
        storage.save_hooks_state(&state)?;

        Ok(vec![session_id])
    }
}

/// Counters and results from one import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Sessions imported this run.
    pub imported: usize,
    /// Sessions skipped (already imported or empty).
    pub skipped: usize,
    /// Plan artifacts imported.
    pub plans_imported: usize,
    /// Todo list artifacts imported.
    pub todos_imported: usize,
    /// Task tree artifacts imported.
    pub tasks_imported: usize,
    /// Todo items counted in a dry run.
    pub dry_run_todo_items: usize,
    /// Task items counted in a dry run.
    pub dry_run_task_items: usize,
}

/// Import source: retroactively ingests the external CLI's historical
/// sessions and artifacts for this project.
#[derive(Debug, Default)]
pub struct ImportSource {
    dry_run: bool,
    /// Counters from the last `ingest` call.
    pub outcome: ImportOutcome,
}

impl ImportSource {
    /// Creates an import source. With `dry_run`, nothing is written; the
    /// counters report what a real run would import.
    #[must_use]
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            outcome: ImportOutcome::default(),
        }
    }

    fn import_sessions(&mut self, storage: &NdjsonStorage, cwd: &str) -> Result<Vec<String>> {
        let session_files = transcript::discover_claude_sessions(cwd);
        if session_files.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = storage.load_import_state();
        let config = storage.read_config()?;
        let mut session_ids = Vec::new();

        for jsonl_file in session_files {
            let Some(claude_uuid) = jsonl_file.file_stem().map(|s| s.to_string_lossy().into_owned())
            else {
                continue;
            };

            if state.imported.contains_key(&claude_uuid) {
                self.outcome.skipped += 1;
                continue;
            }

            let turns = transcript::extract_turns(&jsonl_file);
            if turns.is_empty() {
                self.outcome.skipped += 1;
                continue;
            }

            if self.dry_run {
                self.outcome.imported += 1;
                continue;
            }

            let started_at = transcript::parse_ts(turns[0].timestamp.as_deref());
            let ended_at = transcript::parse_ts(
                turns
                    .last()
                    .and_then(|t| t.timestamp.as_deref()),
            );

            let mut meta = storage.create_session(
                &["claude".to_string()],
                cwd,
                Some(EventSource::Import),
                false,
            )?;
            let session_id = meta.session_id.clone();

            let chunks = transcript::chunks_from_turns(&turns, &session_id, &config.chunking);
            storage.write_chunks(&session_id, &chunks)?;

            // Restore the original conversation's time window.
            if started_at > 0.0 {
                meta.started_at = started_at;
            }
            meta.ended_at = Some(if ended_at > 0.0 { ended_at } else { now_epoch() });
            storage.write_meta(&meta)?;

            state.imported.insert(claude_uuid, session_id.clone());
            storage.save_import_state(&state)?;

            session_ids.push(session_id);
            self.outcome.imported += 1;
        }

        Ok(session_ids)
    }

    fn import_todos(&mut self, storage: &NdjsonStorage, cwd: &str) -> Result<Vec<Chunk>> {
        let mut new_chunks = Vec::new();
        for todo_file in transcript::discover_todos(cwd) {
            let Some(stem) = todo_file.file_stem().map(|s| s.to_string_lossy().into_owned())
            else {
                continue;
            };
            let destination = storage.artifacts_dir().join("todos").join(format!("{stem}.json"));
            if destination.exists() {
                continue;
            }

            let Ok(text) = fs::read_to_string(&todo_file) else {
                continue;
            };
            let Ok(items) = serde_json::from_str::<Vec<TodoItem>>(&text) else {
                tracing::warn!(file = %todo_file.display(), "skipping malformed todo file");
                continue;
            };

            if self.dry_run {
                self.outcome.todos_imported += 1;
                self.outcome.dry_run_todo_items += items.len();
                continue;
            }

            let list = TodoList {
                session_id: stem,
                agent_id: None,
                items,
                file_path: todo_file.to_string_lossy().into_owned(),
                mtime: file_mtime_epoch(&todo_file),
            };
            storage.write_todo_list(&list)?;
            new_chunks.extend(artifacts::chunk_todo_list(&list));
            self.outcome.todos_imported += 1;
        }
        Ok(new_chunks)
    }

    fn import_tasks(&mut self, storage: &NdjsonStorage, cwd: &str) -> Result<Vec<Chunk>> {
        let mut new_chunks = Vec::new();
        for task_dir in transcript::discover_task_dirs(cwd) {
            let Some(stem) = task_dir.file_name().map(|s| s.to_string_lossy().into_owned())
            else {
                continue;
            };
            if storage.artifacts_dir().join("tasks").join(&stem).exists() {
                continue;
            }

            let tasks = read_task_files(&task_dir, &stem);
            if tasks.is_empty() {
                continue;
            }

            if self.dry_run {
                self.outcome.tasks_imported += 1;
                self.outcome.dry_run_task_items += tasks.len();
                continue;
            }

            for task in &tasks {
                storage.write_task(task)?;
                new_chunks.push(artifacts::chunk_task(task));
            }
            self.outcome.tasks_imported += 1;
        }
        Ok(new_chunks)
    }

    fn import_plans(&mut self, storage: &NdjsonStorage, cwd: &str) -> Result<Vec<Chunk>> {
        let mut new_chunks = Vec::new();
        let slugs = transcript::discover_plan_slugs(cwd);
        for plan_file in transcript::discover_plans(&slugs) {
            let Some(slug) = plan_file.file_stem().map(|s| s.to_string_lossy().into_owned())
            else {
                continue;
            };
            if storage
                .artifacts_dir()
                .join("plans")
                .join(format!("{slug}.md"))
                .exists()
            {
                continue;
            }

            let Ok(content) = fs::read_to_string(&plan_file) else {
                continue;
            };

            if self.dry_run {
                self.outcome.plans_imported += 1;
                continue;
            }

            let mtime = file_mtime_epoch(&plan_file);
            let meta = PlanMeta {
                slug: slug.clone(),
                session_id: String::new(),
                timestamp: None,
                file_path: plan_file.to_string_lossy().into_owned(),
                mtime,
            };
            storage.write_plan(&content, &meta)?;
            new_chunks.extend(artifacts::chunk_plan(&slug, &content, mtime));
            self.outcome.plans_imported += 1;
        }
        Ok(new_chunks)
    }
}

/// Reads the task JSON files of one directory, skipping dotfiles like
/// `.lock` and `.highwatermark`.
fn read_task_files(task_dir: &PathBuf, session_stem: &str) -> Vec<TaskItem> {
    let Ok(entries) = fs::read_dir(task_dir) else {
        return Vec::new();
    };
    let mut tasks: Vec<TaskItem> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "json")
                && !p
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'))
        })
        .filter_map(|p| {
            let text = fs::read_to_string(&p).ok()?;
            let mut task: TaskItem = serde_json::from_str(&text).ok()?;
            if task.session_id.is_empty() {
                task.session_id = session_stem.to_string();
            }
            Some(task)
        })
        .collect();
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    tasks
}

impl Source for ImportSource {
    fn ingest(&mut self, storage: &NdjsonStorage) -> Result<Vec<String>> {
        self.outcome = ImportOutcome::default();
        let cwd = storage
            .root()
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let session_ids = self.import_sessions(storage, &cwd)?;

        let mut new_chunks = Vec::new();
        new_chunks.extend(self.import_todos(storage, &cwd)?);
        new_chunks.extend(self.import_tasks(storage, &cwd)?);
        new_chunks.extend(self.import_plans(storage, &cwd)?);

        if !self.dry_run && !new_chunks.is_empty() {
            let mut all = storage.read_artifact_chunks();
            all.extend(new_chunks);
            storage.write_artifact_chunks(&all)?;
        }

        Ok(session_ids)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::io::Write as IoWrite;

    fn temp_storage() -> (tempfile::TempDir, NdjsonStorage) {
        let dir = tempfile::tempdir().unwrap();
        let (_, storage) = NdjsonStorage::init(dir.path().join(".memory-bank")).unwrap();
        (dir, storage)
    }

    fn write_transcript(path: &Path, turns: usize) {
        let mut file = fs::File::create(path).unwrap();
        for i in 0..turns {
            writeln!(
                file,
                r#"{{"type":"user","message":{{"content":"prompt number {i} with enough words"}},"timestamp":"2026-01-15T10:0{i}:00Z"}}"#
            )
            .unwrap();
            writeln!(
                file,
                r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"answer number {i}"}}]}}}}"#
            )
            .unwrap();
        }
    }

    #[test]
    fn test_chunk_processor_skips_existing() {
        let (_dir, storage) = temp_storage();
        let meta = storage
            .create_session(&["sh".to_string()], "/tmp", None, true)
            .unwrap();
        storage
            .write_event(&meta.session_id, "stdout", "terminal", "some output text", 0.1)
            .unwrap();

        ChunkProcessor::default()
            .process(&storage, &[meta.session_id.clone()])
            .unwrap();
        let first = storage.read_chunks(&meta.session_id).unwrap();
        assert!(!first.is_empty());

        // A second non-forced run leaves the chunks untouched.
        storage
            .write_event(&meta.session_id, "stdout", "terminal", "new material", 0.2)
            .unwrap();
        ChunkProcessor::default()
            .process(&storage, &[meta.session_id.clone()])
            .unwrap();
        assert_eq!(storage.read_chunks(&meta.session_id).unwrap(), first);

        ChunkProcessor { force: true }
            .process(&storage, &[meta.session_id.clone()])
            .unwrap();
        let rechunked = storage.read_chunks(&meta.session_id).unwrap();
        assert!(rechunked.iter().any(|c| c.text.contains("new material")));
    }

    #[test]
    fn test_hook_source_missing_transcript_noop() {
        let (_dir, storage) = temp_storage();
        let mut source = HookSource::new(
            "/nonexistent/transcript.jsonl".to_string(),
            "/tmp".to_string(),
            "ext-1".to_string(),
        );
        assert!(source.ingest(&storage).unwrap().is_empty());
    }

    #[test]
    fn test_hook_source_creates_then_skips_unchanged() {
        let (dir, storage) = temp_storage();
        let transcript_path = dir.path().join("transcript.jsonl");
        write_transcript(&transcript_path, 2);

        let mut source = HookSource::new(
            transcript_path.to_string_lossy().into_owned(),
            dir.path().to_string_lossy().into_owned(),
            "ext-uuid-1".to_string(),
        );

        let first = source.ingest(&storage).unwrap();
        assert_eq!(first.len(), 1);
        let session_id = &first[0];
        assert!(storage.has_chunks(session_id));
        let meta = storage.read_meta(session_id).unwrap();
        assert_eq!(meta.source, Some(EventSource::Hook));
        assert!(meta.ended_at.is_some());

        // Unchanged transcript: no-op.
        let second = source.ingest(&storage).unwrap();
        assert!(second.is_empty());

        // Grown transcript: same session, chunks rewritten.
        write_transcript(&transcript_path, 4);
        let third = source.ingest(&storage).unwrap();
        assert_eq!(third, vec![session_id.clone()]);
        let chunks = storage.read_chunks(session_id).unwrap();
        assert!(chunks.iter().any(|c| c.text.contains("number 3")));
    }

    #[test]
    fn test_import_outcome_default() {
        let outcome = ImportOutcome::default();
        assert_eq!(outcome.imported, 0);
        assert_eq!(outcome.skipped, 0);
    }

    #[test]
    fn test_read_task_files_skips_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("1.json"),
            r#"{"id": "1", "subject": "real task"}"#,
        )
        .unwrap();
        fs::write(dir.path().join(".lock"), "").unwrap();
        fs::write(dir.path().join(".highwatermark"), "2").unwrap();

        let tasks = read_task_files(&dir.path().to_path_buf(), "stem");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].subject, "real task");
        assert_eq!(tasks[0].session_id, "stem");
    }

    #[test]
    fn test_pipeline_runs_processors_in_order() {
        let (_dir, storage) = temp_storage();
        let meta = storage
            .create_session(&["sh".to_string()], "/tmp", None, true)
            .unwrap();
        storage
            .write_event(&meta.session_id, "stdout", "terminal", "pipeline output", 0.1)
            .unwrap();

        let pipeline = ProcessorPipeline::new(vec![Box::new(ChunkProcessor::default())]);
        pipeline.run(&storage, &[meta.session_id.clone()]).unwrap();
        assert!(storage.has_chunks(&meta.session_id));
    }
}
