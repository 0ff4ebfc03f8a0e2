//! CLI command implementations.
//!
//! Contains the business logic for each CLI command. Every command returns
//! its output text plus an exit code; `main` prints and exits once. The
//! hidden hook entry points swallow all errors so the external AI CLI is
//! never blocked by ours.

use std::fmt::Write as FmtWrite;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::cli::output::{
    format_global_result, format_graph_json, format_graph_table, format_search_result,
    format_sessions_table,
};
use crate::cli::parser::{Cli, Commands, HooksCommands, ProjectsCommands};
use crate::core::models::PackFormat;
use crate::error::{MbError, Result};
use crate::graph::SessionGraph;
use crate::ollama::OllamaClient;
use crate::pack::{build_pack, PackRequest};
use crate::pack_modes::PackMode;
use crate::pipeline::{ChunkProcessor, HookSource, ImportSource, ProcessorPipeline, Source};
use crate::search::{global_search, semantic_search, SearchParams};
use crate::storage::NdjsonStorage;
use crate::{hooks, migrations, registry};

/// Output and exit code of one command.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// Text for stdout (may be empty).
    pub output: String,
    /// Process exit code.
    pub exit_code: i32,
}

impl From<String> for CommandResult {
    fn from(output: String) -> Self {
        Self {
            output,
            exit_code: 0,
        }
    }
}

fn storage_root() -> Result<PathBuf> {
    Ok(NdjsonStorage::default_root(&std::env::current_dir()?))
}

fn require_storage() -> Result<NdjsonStorage> {
    NdjsonStorage::open(storage_root()?)
}

/// Opens storage, initializing it first when missing. Returns the storage
/// and whether initialization happened.
fn storage_auto_init() -> Result<(NdjsonStorage, bool)> {
    let (created, storage) = NdjsonStorage::init(storage_root()?)?;
    Ok((storage, created))
}

/// Executes the parsed CLI command.
pub fn execute(cli: &Cli) -> Result<CommandResult> {
    match &cli.command {
        Commands::Init => cmd_init(),
        Commands::Run { child_cmd } => cmd_run(child_cmd),
        Commands::Sessions => cmd_sessions(),
        Commands::Delete { session_id } => cmd_delete(session_id),
        Commands::Search {
            query,
            top,
            result_type,
            rerank,
            no_decay,
            global,
            json,
        } => cmd_search(
            query,
            *top,
            result_type.as_deref(),
            *rerank,
            *no_decay,
            *global,
            *json,
        ),
        Commands::Pack {
            budget,
            format,
            out,
            mode,
        } => cmd_pack(*budget, format, out.as_deref(), mode),
        Commands::Import { dry_run } => cmd_import(*dry_run),
        Commands::Graph { json } => cmd_graph(*json),
        Commands::Migrate => cmd_migrate(),
        Commands::Reindex => cmd_reindex(),
        Commands::Hooks(sub) => cmd_hooks(sub),
        Commands::Projects { json, command } => cmd_projects(*json, command.as_ref()),
        Commands::HookStop => Ok(cmd_hook_stop()),
        Commands::HookSessionStart => Ok(cmd_hook_session_start()),
    }
}

fn cmd_init() -> Result<CommandResult> {
    let (storage, created) = storage_auto_init()?;
    if created {
        if let Some(project) = storage.root().parent() {
            registry::register_project(&project.to_string_lossy())?;
        }
        Ok(CommandResult::from(
            "Initialized Memory Bank in .memory-bank/\n\
             Warning: Captured sessions may contain sensitive data (API keys, passwords).\n\
             \x20        .memory-bank/ has been added to .gitignore."
                .to_string(),
        ))
    } else {
        Ok(CommandResult::from(
            "Memory Bank already initialized in .memory-bank/".to_string(),
        ))
    }
}

#[cfg(unix)]
fn cmd_run(child_cmd: &[String]) -> Result<CommandResult> {
    use crate::pipeline::PtySource;

    if child_cmd.is_empty() {
        return Err(MbError::InvalidInput(
            "No command specified. Usage: mb run -- <command>".to_string(),
        ));
    }

    let (storage, _) = storage_auto_init()?;

    let mut source = PtySource::new(child_cmd.to_vec());
    let session_ids = source.ingest(&storage)?;

    let pipeline = ProcessorPipeline::new(vec![Box::new(ChunkProcessor::default())]);
    pipeline.run(&storage, &session_ids)?;

    Ok(CommandResult {
        output: String::new(),
        exit_code: source.exit_code,
    })
}

#[cfg(not(unix))]
fn cmd_run(_child_cmd: &[String]) -> Result<CommandResult> {
    Err(MbError::InvalidInput(
        "PTY capture requires a Unix platform.".to_string(),
    ))
}

fn cmd_sessions() -> Result<CommandResult> {
    let storage = require_storage()?;
    let sessions = storage.list_sessions();
    if sessions.is_empty() {
        return Ok(CommandResult::from("No sessions found.".to_string()));
    }
    let counts = storage.count_artifacts();
    Ok(CommandResult::from(format_sessions_table(&sessions, &counts)))
}

fn cmd_delete(session_id: &str) -> Result<CommandResult> {
    let storage = require_storage()?;
    if !storage.delete_session(session_id)? {
        return Err(MbError::UnknownSession(session_id.to_string()));
    }

    // Drop the whole index: its rows still reference the deleted session.
    let index_dir = storage.index_dir();
    if index_dir.exists() {
        for entry in std::fs::read_dir(&index_dir)?.flatten() {
            let path = entry.path();
            if path.is_file() {
                std::fs::remove_file(path)?;
            }
        }
    }

    Ok(CommandResult::from(format!(
        "Deleted session {session_id}. Index cleared."
    )))
}

#[allow(clippy::fn_params_excessive_bools)]
fn cmd_search(
    query: &str,
    top: usize,
    result_type: Option<&str>,
    rerank: bool,
    no_decay: bool,
    global: bool,
    json: bool,
) -> Result<CommandResult> {
    if query.trim().is_empty() {
        return Err(MbError::InvalidInput(
            "Search query cannot be empty.".to_string(),
        ));
    }
    if top < 1 {
        return Err(MbError::InvalidInput("--top must be at least 1.".to_string()));
    }

    let params = SearchParams {
        top_k: top,
        artifact_type: result_type.map(ToString::to_string),
        rerank,
        no_decay,
    };

    if global {
        return cmd_search_global(query, &params, json);
    }

    let storage = require_storage()?;
    if storage.list_sessions().is_empty() {
        return Ok(CommandResult::from(
            "No sessions found. Run `mb run -- <command>` to capture a session first.".to_string(),
        ));
    }

    let config = storage.read_config()?;
    let client = OllamaClient::from_config(&config);
    let results = semantic_search(query, &params, &storage, &client)?;

    if json {
        return Ok(CommandResult::from(serde_json::to_string_pretty(&results)?));
    }

    let mut out = String::new();
    for result in &results {
        let _ = writeln!(out, "{}", format_search_result(result));
    }
    out.push_str("No more results.");
    Ok(CommandResult::from(out))
}

fn cmd_search_global(query: &str, params: &SearchParams, json: bool) -> Result<CommandResult> {
    let projects = registry::list_projects();
    if projects.is_empty() {
        return Ok(CommandResult::from(
            "No projects registered. Run 'mb init' in your project directories.".to_string(),
        ));
    }

    // Borrow Ollama settings from the first reachable project.
    let mut client = None;
    for (path, _) in &projects {
        let root = NdjsonStorage::default_root(Path::new(path));
        if let Ok(storage) = NdjsonStorage::open(root) {
            if let Ok(config) = storage.read_config() {
                client = Some(OllamaClient::from_config(&config));
                break;
            }
        }
    }
    let Some(client) = client else {
        return Err(MbError::InvalidInput(
            "No reachable projects found with valid configuration.".to_string(),
        ));
    };

    let results = global_search(query, params, &client)?;

    if json {
        return Ok(CommandResult::from(serde_json::to_string_pretty(&results)?));
    }

    let mut out = String::new();
    for result in &results {
        let _ = writeln!(out, "{}", format_global_result(result));
    }
    out.push_str("No more results.");
    Ok(CommandResult::from(out))
}

fn cmd_pack(budget: usize, format: &str, out: Option<&Path>, mode: &str) -> Result<CommandResult> {
    if budget < 100 {
        return Err(MbError::InvalidInput("--budget must be at least 100.".to_string()));
    }
    let Some(pack_format) = PackFormat::parse(format) else {
        return Err(MbError::InvalidInput(format!("Unknown pack format: {format}")));
    };
    let Some(pack_mode) = PackMode::parse(mode) else {
        return Err(MbError::InvalidInput(format!("Unknown pack mode: {mode}")));
    };

    let storage = require_storage()?;
    let config = storage.read_config()?;
    let client = OllamaClient::from_config(&config);

    let output = build_pack(
        &storage,
        &client,
        &PackRequest {
            budget,
            format: pack_format,
            mode: pack_mode,
        },
    )?;

    if let Some(path) = out {
        std::fs::write(path, &output)?;
        eprintln!("Context pack written to {}", path.display());
        Ok(CommandResult::default())
    } else {
        Ok(CommandResult::from(output))
    }
}

fn cmd_import(dry_run: bool) -> Result<CommandResult> {
    let (storage, created) = storage_auto_init()?;
    let mut out = String::new();
    if created {
        let _ = writeln!(out, "Initialized Memory Bank in .memory-bank/");
    }

    let is_first_import = storage.load_import_state().imported.is_empty();

    let mut source = ImportSource::new(dry_run);
    source.ingest(&storage)?;
    let outcome = source.outcome;

    if !dry_run && outcome.imported > 0 {
        let session_count = storage.list_sessions().len();
        if let Some(project) = storage.root().parent() {
            registry::update_project_stats(&project.to_string_lossy(), session_count)?;
        }
    }

    if outcome.imported == 0 && outcome.skipped == 0 {
        out.push_str("No Claude Code sessions found for this project.");
        return Ok(CommandResult::from(out));
    }

    let mut artifact_parts = Vec::new();
    if outcome.plans_imported > 0 {
        artifact_parts.push(format!("{} plans", outcome.plans_imported));
    }

    if dry_run {
        let _ = writeln!(
            out,
            "Would import {} sessions ({} already imported)",
            outcome.imported, outcome.skipped
        );
        if outcome.todos_imported > 0 {
            artifact_parts.push(format!(
                "{} todo lists ({} items)",
                outcome.todos_imported, outcome.dry_run_todo_items
            ));
        }
        if outcome.tasks_imported > 0 {
            artifact_parts.push(format!(
                "{} task trees ({} tasks)",
                outcome.tasks_imported, outcome.dry_run_task_items
            ));
        }
        if artifact_parts.is_empty() {
            out.push_str("No artifacts found for this project");
        } else {
            let _ = write!(out, "Would import artifacts: {}", artifact_parts.join(", "));
        }
    } else {
        let _ = writeln!(
            out,
            "Imported {} sessions ({} skipped)",
            outcome.imported, outcome.skipped
        );
        if outcome.todos_imported > 0 {
            artifact_parts.push(format!("{} todo lists", outcome.todos_imported));
        }
        if outcome.tasks_imported > 0 {
            artifact_parts.push(format!("{} task trees", outcome.tasks_imported));
        }
        if artifact_parts.is_empty() {
            out.push_str("No artifacts found for this project");
        } else {
            let _ = write!(out, "Imported artifacts: {}", artifact_parts.join(", "));
        }

        if is_first_import && outcome.imported > 0 {
            let _ = write!(
                out,
                "\nTip: Auto-inject context on session start? Run: mb hooks install --autostart"
            );
        }
    }

    Ok(CommandResult::from(out))
}

fn cmd_graph(json: bool) -> Result<CommandResult> {
    let storage = require_storage()?;
    let nodes = SessionGraph::new().build_graph(&storage)?;
    if nodes.is_empty() {
        return Ok(CommandResult::from("No sessions found.".to_string()));
    }
    if json {
        Ok(CommandResult::from(format_graph_json(&nodes)))
    } else {
        Ok(CommandResult::from(format_graph_table(&nodes)))
    }
}

fn cmd_migrate() -> Result<CommandResult> {
    let storage = require_storage()?;
    let (old_version, new_version) = migrations::migrate(&storage)?;
    if old_version == new_version {
        Ok(CommandResult::from(format!("Already up to date (v{new_version}).")))
    } else {
        Ok(CommandResult::from(format!(
            "Migrated from v{old_version} to v{new_version}."
        )))
    }
}

fn cmd_reindex() -> Result<CommandResult> {
    let storage = require_storage()?;
    let config = storage.read_config()?;
    let client = OllamaClient::from_config(&config);
    let stats = migrations::reindex(&storage, &client)?;
    Ok(CommandResult::from(format!(
        "Reindexed {} chunks from {} sessions.",
        stats.chunks, stats.sessions
    )))
}

fn cmd_hooks(sub: &HooksCommands) -> Result<CommandResult> {
    let Some(settings_path) = hooks::default_settings_path() else {
        return Err(MbError::InvalidInput("Cannot resolve home directory.".to_string()));
    };

    match sub {
        HooksCommands::Install { autostart } => {
            let (_, message) = hooks::install_hooks(&settings_path, *autostart)?;
            Ok(CommandResult::from(message))
        }
        HooksCommands::Uninstall => {
            let (_, message) = hooks::uninstall_hooks(&settings_path)?;
            Ok(CommandResult::from(message))
        }
        HooksCommands::Status => {
            let status = hooks::hooks_status(&settings_path)?;
            let mut out = String::new();
            match &status.stop.command {
                Some(command) => {
                    let _ = writeln!(out, "Stop hook: Installed ({command})");
                }
                None => {
                    let _ = writeln!(out, "Stop hook: Not installed");
                }
            }
            match &status.session_start.command {
                Some(command) => {
                    let _ = write!(out, "SessionStart hook: Installed ({command})");
                }
                None => {
                    let _ = write!(out, "SessionStart hook: Not installed");
                }
            }
            Ok(CommandResult::from(out))
        }
    }
}

fn cmd_projects(json: bool, command: Option<&ProjectsCommands>) -> Result<CommandResult> {
    if let Some(ProjectsCommands::Remove { path }) = command {
        return if registry::remove_project(path)? {
            Ok(CommandResult::from(format!("Removed {path} from registry.")))
        } else {
            Ok(CommandResult::from(format!(
                "Project {path} not found in registry."
            )))
        };
    }

    let projects = registry::list_projects();
    if projects.is_empty() {
        return Ok(CommandResult::from("No projects registered.".to_string()));
    }

    if json {
        let items: Vec<Value> = projects
            .iter()
            .map(|(path, entry)| {
                let reachable = NdjsonStorage::default_root(Path::new(path)).is_dir();
                serde_json::json!({
                    "path": path,
                    "session_count": entry.session_count,
                    "last_import": (entry.last_import > 0.0).then_some(entry.last_import),
                    "reachable": reachable,
                })
            })
            .collect();
        return Ok(CommandResult::from(serde_json::to_string_pretty(
            &serde_json::json!({"projects": items}),
        )?));
    }

    let mut out = String::new();
    let _ = writeln!(out, "{:<42}{:>8}  {}", "PROJECT", "SESSIONS", "LAST IMPORT");
    for (path, entry) in &projects {
        let reachable = NdjsonStorage::default_root(Path::new(path)).is_dir();
        let last_import = if entry.last_import > 0.0 {
            chrono::DateTime::<chrono::Utc>::from_timestamp(entry.last_import as i64, 0)
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "never".to_string())
        } else {
            "never".to_string()
        };
        let suffix = if reachable { "" } else { "  (unreachable)" };
        let _ = writeln!(
            out,
            "{:<42}{:>8}  {}{}",
            path, entry.session_count, last_import, suffix
        );
    }
    Ok(CommandResult::from(out.trim_end().to_string()))
}

/// Stop-hook entry point. Reads the hook payload from stdin and processes
/// the transcript into chunks. Never fails: the host CLI must not be
/// blocked by ours.
fn cmd_hook_stop() -> CommandResult {
    let result: Result<()> = (|| {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw)?;
        let payload: Value = serde_json::from_str(&raw)?;

        let Some(transcript_path) = payload.get("transcript_path").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(claude_session_id) = payload.get("session_id").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(cwd) = payload
            .get("cwd")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
        else {
            return Ok(());
        };

        let root = NdjsonStorage::default_root(Path::new(cwd));
        let (_, storage) = NdjsonStorage::init(root)?;

        let mut source = HookSource::new(
            transcript_path.to_string(),
            cwd.to_string(),
            claude_session_id.to_string(),
        );
        source.ingest(&storage)?;
        Ok(())
    })();

    if let Err(err) = result {
        tracing::debug!(%err, "stop hook failed");
    }
    CommandResult::default()
}

/// SessionStart-hook entry point. Emits a lightweight pack on startup when
/// data is ready; silent otherwise. Never fails.
fn cmd_hook_session_start() -> CommandResult {
    let result: Result<Option<String>> = (|| {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw)?;
        let payload: Value = serde_json::from_str(&raw)?;

        if payload.get("source").and_then(Value::as_str) != Some("startup") {
            return Ok(None);
        }

        let storage = require_storage()?;
        if storage.list_sessions().is_empty() {
            return Ok(None);
        }
        if storage.all_chunks().is_empty() {
            return Ok(None);
        }

        let config = storage.read_config()?;
        let client = OllamaClient::from_config(&config);
        let output = build_pack(
            &storage,
            &client,
            &PackRequest {
                budget: 6000,
                format: PackFormat::Xml,
                mode: PackMode::Auto,
            },
        )?;
        Ok(Some(output))
    })();

    match result {
        Ok(Some(output)) => CommandResult::from(output),
        Ok(None) => CommandResult::default(),
        Err(err) => {
            tracing::debug!(%err, "session-start hook failed");
            CommandResult::default()
        }
    }
}
