//! End-to-end CLI tests. Each test gets an isolated project directory and
//! an isolated `$HOME` so the global registry and hook settings never leak
//! between tests or into the developer's real home.

#![allow(clippy::unwrap_used)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

struct TestEnv {
    _tmp: tempfile::TempDir,
    home: PathBuf,
    project: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("home");
        let project = tmp.path().join("project");
        fs::create_dir_all(&home).unwrap();
        fs::create_dir_all(&project).unwrap();
        Self {
            _tmp: tmp,
            home,
            project,
        }
    }

    fn mb(&self) -> Command {
        let mut cmd = Command::cargo_bin("mb").unwrap();
        cmd.current_dir(&self.project).env("HOME", &self.home);
        cmd
    }

    fn storage(&self) -> PathBuf {
        self.project.join(".memory-bank")
    }

    /// The external CLI's transcript directory for this project.
    fn claude_project_dir(&self) -> PathBuf {
        let cwd = self.project.canonicalize().unwrap();
        let encoded = format!(
            "-{}",
            cwd.to_string_lossy()
                .trim_start_matches('/')
                .replace(['/', '_'], "-")
        );
        self.home.join(".claude").join("projects").join(encoded)
    }

    fn write_transcript(&self, name: &str) {
        let dir = self.claude_project_dir();
        fs::create_dir_all(&dir).unwrap();
        let lines = [
            r#"{"type":"user","message":{"content":"Please fix the failing login test"},"timestamp":"2026-01-15T10:00:00Z"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"The assertion expected a 200 but the handler returns 302 after the redirect change."}]}}"#,
            r#"{"type":"user","message":{"content":"Great, apply that and rerun"},"timestamp":"2026-01-15T10:05:00Z"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Done, the suite passes now."}]}}"#,
        ];
        fs::write(dir.join(name), lines.join("\n") + "\n").unwrap();
    }
}

#[test]
fn test_init_creates_storage_and_is_idempotent() {
    let env = TestEnv::new();

    env.mb()
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized Memory Bank"));
    assert!(env.storage().join("config.json").exists());
    assert!(env.storage().join("sessions").is_dir());

    let gitignore = fs::read_to_string(env.project.join(".gitignore")).unwrap();
    assert!(gitignore.contains(".memory-bank/"));

    env.mb()
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("already initialized"));
}

#[test]
fn test_uninitialized_commands_exit_one() {
    let env = TestEnv::new();
    env.mb()
        .arg("sessions")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not initialized"));
}

#[cfg(unix)]
#[test]
fn test_run_echo_captures_session() {
    let env = TestEnv::new();

    env.mb().args(["run", "--", "echo", "hello"]).assert().code(0);

    let sessions_dir = env.storage().join("sessions");
    let session_dirs: Vec<_> = fs::read_dir(&sessions_dir).unwrap().flatten().collect();
    assert_eq!(session_dirs.len(), 1);

    let session_dir = session_dirs[0].path();
    let meta: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(session_dir.join("meta.json")).unwrap()).unwrap();
    assert_eq!(meta["exit_code"], 0);
    assert_eq!(meta["source"], "pty");

    let events = fs::read_to_string(session_dir.join("events.jsonl")).unwrap();
    assert!(events.contains("session_start"));
    assert!(events.contains("session_end"));
    assert!(events.contains("hello"));

    // Post-ingest chunking ran.
    assert!(session_dir.join("chunks.jsonl").exists());
}

#[cfg(unix)]
#[test]
fn test_run_propagates_child_exit_code() {
    let env = TestEnv::new();
    env.mb()
        .args(["run", "--", "sh", "-c", "exit 7"])
        .assert()
        .code(7);
}

#[cfg(unix)]
#[test]
fn test_sessions_lists_captured_session() {
    let env = TestEnv::new();
    env.mb().args(["run", "--", "echo", "listed"]).assert().code(0);

    env.mb()
        .arg("sessions")
        .assert()
        .success()
        .stdout(predicate::str::contains("SESSION"))
        .stdout(predicate::str::contains("echo listed"));
}

#[test]
fn test_delete_unknown_session_exits_one() {
    let env = TestEnv::new();
    env.mb().arg("init").assert().success();
    env.mb()
        .args(["delete", "20990101-000000-dead"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}

#[cfg(unix)]
#[test]
fn test_delete_session_clears_index() {
    let env = TestEnv::new();
    env.mb().args(["run", "--", "echo", "gone"]).assert().code(0);

    let session_id = fs::read_dir(env.storage().join("sessions"))
        .unwrap()
        .flatten()
        .next()
        .unwrap()
        .file_name()
        .to_string_lossy()
        .into_owned();

    // A fake index file must disappear on delete.
    let index_dir = env.storage().join("index");
    fs::create_dir_all(&index_dir).unwrap();
    fs::write(index_dir.join("vectors.bin"), b"stale").unwrap();

    env.mb()
        .args(["delete", &session_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Index cleared"));
    assert!(!index_dir.join("vectors.bin").exists());
}

#[test]
fn test_search_empty_query_exits_one() {
    let env = TestEnv::new();
    env.mb().arg("init").assert().success();
    env.mb().args(["search", "   "]).assert().code(1);
}

#[cfg(unix)]
#[test]
fn test_search_without_ollama_exits_two() {
    let env = TestEnv::new();
    env.mb().args(["run", "--", "echo", "searchable content"]).assert().code(0);

    // Point the embed endpoint at a dead port.
    let config_path = env.storage().join("config.json");
    let mut config: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();
    config["ollama"]["base_url"] = serde_json::json!("http://127.0.0.1:1");
    fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    env.mb()
        .args(["search", "anything"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Cannot connect to Ollama"));
}

#[cfg(unix)]
#[test]
fn test_graph_classifies_sessions() {
    let env = TestEnv::new();
    env.mb().args(["run", "--", "echo", "build output"]).assert().code(0);

    env.mb()
        .arg("graph")
        .assert()
        .success()
        .stdout(predicate::str::contains("EPISODE"))
        .stdout(predicate::str::contains("build"));

    env.mb()
        .args(["graph", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"episode_type\""));
}

#[test]
fn test_migrate_fresh_storage_up_to_date() {
    let env = TestEnv::new();
    env.mb().arg("init").assert().success();
    env.mb()
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Already up to date (v2)."));
}

#[test]
fn test_import_then_reimport_is_noop() {
    let env = TestEnv::new();
    env.write_transcript("aaaa-bbbb-cccc.jsonl");

    env.mb()
        .arg("import")
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported 1 sessions (0 skipped)"));

    env.mb()
        .arg("import")
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported 0 sessions (1 skipped)"));

    // The imported session carries chunks from the transcript turns.
    let sessions: Vec<_> = fs::read_dir(env.storage().join("sessions"))
        .unwrap()
        .flatten()
        .collect();
    assert_eq!(sessions.len(), 1);
    let chunks = fs::read_to_string(sessions[0].path().join("chunks.jsonl")).unwrap();
    assert!(chunks.contains("failing login test"));
    assert!(chunks.contains("claude_native"));
}

#[test]
fn test_import_dry_run_writes_nothing() {
    let env = TestEnv::new();
    env.write_transcript("dddd-eeee-ffff.jsonl");

    env.mb()
        .args(["import", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Would import 1 sessions"));

    let sessions: Vec<_> = fs::read_dir(env.storage().join("sessions"))
        .unwrap()
        .flatten()
        .collect();
    assert!(sessions.is_empty());
}

#[test]
fn test_import_with_todo_artifact() {
    let env = TestEnv::new();
    env.write_transcript("session-todo.jsonl");

    let todos_dir = env.home.join(".claude").join("todos");
    fs::create_dir_all(&todos_dir).unwrap();
    fs::write(
        todos_dir.join("session-todo.json"),
        r#"[{"id":"1","content":"Fix bug","status":"pending","priority":"high"}]"#,
    )
    .unwrap();

    env.mb()
        .arg("import")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 todo lists"));

    assert!(env
        .storage()
        .join("artifacts")
        .join("todos")
        .join("session-todo.json")
        .exists());
    let chunks = fs::read_to_string(env.storage().join("artifacts").join("chunks.jsonl")).unwrap();
    assert!(chunks.contains("\"artifact_type\":\"todo\""));
    assert!(chunks.contains("Fix bug"));
}

#[test]
fn test_hooks_install_status_uninstall_roundtrip() {
    let env = TestEnv::new();

    env.mb()
        .args(["hooks", "install", "--autostart"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stop + SessionStart"));

    // Second install does not duplicate.
    env.mb()
        .args(["hooks", "install", "--autostart"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already installed"));

    let settings: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(env.home.join(".claude").join("settings.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(settings["hooks"]["Stop"].as_array().unwrap().len(), 1);

    env.mb()
        .args(["hooks", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stop hook: Installed"))
        .stdout(predicate::str::contains("SessionStart hook: Installed"));

    env.mb()
        .args(["hooks", "uninstall"])
        .assert()
        .success()
        .stdout(predicate::str::contains("uninstalled"));

    env.mb()
        .args(["hooks", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stop hook: Not installed"));
}

#[test]
fn test_projects_registry_listing_and_removal() {
    let env = TestEnv::new();
    env.mb().arg("init").assert().success();

    env.mb()
        .arg("projects")
        .assert()
        .success()
        .stdout(predicate::str::contains("PROJECT"));

    let project_path = env.project.canonicalize().unwrap();
    env.mb()
        .args(["projects", "remove", &project_path.to_string_lossy()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed"));

    env.mb()
        .arg("projects")
        .assert()
        .success()
        .stdout(predicate::str::contains("No projects registered."));
}

#[cfg(unix)]
#[test]
fn test_pack_offline_with_fresh_state() {
    let env = TestEnv::new();
    env.mb().args(["run", "--", "echo", "pack me some content"]).assert().code(0);

    // A fresh cached state lets pack run without a chat model.
    let state_dir = env.storage().join("state");
    fs::create_dir_all(&state_dir).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));
    fs::write(
        state_dir.join("state.json"),
        serde_json::json!({
            "summary": "Echo experiments.",
            "decisions": [],
            "constraints": [],
            "tasks": [],
            "updated_at": 1.0,
            "source_sessions": ["s1"],
        })
        .to_string(),
    )
    .unwrap();

    env.mb()
        .args(["pack", "--format", "md", "--mode", "build"])
        .assert()
        .success()
        .stdout(predicate::str::contains("# Memory Bank Context"))
        .stdout(predicate::str::contains("Echo experiments."));

    // XML output is the default format and stays well-formed.
    env.mb()
        .args(["pack", "--mode", "build"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<MEMORY_BANK_CONTEXT version=\"1.0\">"))
        .stdout(predicate::str::contains("</MEMORY_BANK_CONTEXT>"));
}

#[test]
fn test_pack_budget_too_small_rejected() {
    let env = TestEnv::new();
    env.mb().arg("init").assert().success();
    env.mb()
        .args(["pack", "--budget", "50"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--budget must be at least 100."));
}

#[test]
fn test_hook_stop_swallows_garbage_payload() {
    let env = TestEnv::new();
    env.mb()
        .arg("hook-stop")
        .write_stdin("this is not json")
        .assert()
        .code(0);
}

#[test]
fn test_hook_stop_processes_transcript() {
    let env = TestEnv::new();
    env.write_transcript("hook-session.jsonl");
    let transcript = env.claude_project_dir().join("hook-session.jsonl");

    let payload = serde_json::json!({
        "session_id": "hook-session",
        "transcript_path": transcript.to_string_lossy(),
        "cwd": env.project.canonicalize().unwrap().to_string_lossy(),
    });

    env.mb()
        .arg("hook-stop")
        .write_stdin(payload.to_string())
        .assert()
        .code(0);

    // The hook auto-initialized storage and chunked the transcript.
    assert!(env.storage().join("config.json").exists());
    let hooks_state: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(env.storage().join("hooks_state.json")).unwrap(),
    )
    .unwrap();
    assert!(hooks_state["sessions"]["hook-session"]["mb_session_id"]
        .as_str()
        .is_some());
}

#[test]
fn test_hook_session_start_silent_without_data() {
    let env = TestEnv::new();
    env.mb()
        .arg("hook-session-start")
        .write_stdin(r#"{"source": "startup"}"#)
        .assert()
        .code(0)
        .stdout(predicate::str::is_empty());
}

fn read_dir_names(path: &Path) -> Vec<String> {
    fs::read_dir(path)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn test_import_registers_project_globally() {
    let env = TestEnv::new();
    env.write_transcript("registered.jsonl");
    env.mb().arg("import").assert().success();

    let registry = fs::read_to_string(env.home.join(".memory-bank").join("projects.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&registry).unwrap();
    let projects = value["projects"].as_object().unwrap();
    assert_eq!(projects.len(), 1);
    let entry = projects.values().next().unwrap();
    assert_eq!(entry["session_count"], 1);

    // Sanity: nothing leaked outside the sandbox home.
    assert_eq!(
        read_dir_names(&env.home)
            .iter()
            .filter(|n| *n == ".memory-bank" || *n == ".claude")
            .count(),
        2
    );
}
