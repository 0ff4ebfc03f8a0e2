//! Hook management for the external AI CLI's `~/.claude/settings.json`.
//!
//! `mb hooks install` adds a Stop hook (and, with autostart, a SessionStart
//! hook) that pipes the CLI's JSON payload into our hidden hook
//! subcommands. Entries are matched by marker substring so installs are
//! idempotent and uninstalls remove exactly ours.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::error::Result;

/// Marker identifying our Stop hook command.
pub const STOP_MARKER: &str = "hook-stop";
/// Marker identifying our SessionStart hook command.
pub const SESSION_START_MARKER: &str = "hook-session-start";

/// Installation status of one hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookStatus {
    /// Whether an entry with our marker exists.
    pub installed: bool,
    /// The installed command line, when present.
    pub command: Option<String>,
}

/// Status of both hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HooksStatus {
    /// The Stop hook.
    pub stop: HookStatus,
    /// The SessionStart hook.
    pub session_start: HookStatus,
}

/// Default settings path: `~/.claude/settings.json`.
#[must_use]
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("settings.json"))
}

fn hook_command(subcommand: &str) -> String {
    let exe = std::env::current_exe()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "mb".to_string());
    format!("{exe} {subcommand}")
}

/// Finds the index of our entry in a hook event array by marker substring.
fn find_marked_entry(entries: &[Value], marker: &str) -> Option<usize> {
    entries.iter().position(|entry| {
        entry
            .get("hooks")
            .and_then(Value::as_array)
            .is_some_and(|hooks| {
                hooks.iter().any(|hook| {
                    hook.get("command")
                        .and_then(Value::as_str)
                        .is_some_and(|cmd| cmd.contains(marker))
                })
            })
    })
}

fn marked_command(entries: &[Value], marker: &str) -> Option<String> {
    let idx = find_marked_entry(entries, marker)?;
    entries[idx]
        .get("hooks")
        .and_then(Value::as_array)?
        .iter()
        .find_map(|hook| {
            hook.get("command")
                .and_then(Value::as_str)
                .filter(|cmd| cmd.contains(marker))
                .map(ToString::to_string)
        })
}

fn read_settings(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(json!({}));
    }
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn write_settings(path: &Path, settings: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut text = serde_json::to_string_pretty(settings)?;
    text.push('\n');
    fs::write(path, text)?;
    Ok(())
}

/// Returns the mutable entry array for a hook event, coercing any
/// non-object/non-array intermediate values along the way.
fn event_entries<'a>(settings: &'a mut Value, event: &str) -> Option<&'a mut Vec<Value>> {
    if !settings.is_object() {
        *settings = json!({});
    }
    let obj = settings.as_object_mut()?;
    let hooks = obj.entry("hooks").or_insert_with(|| json!({}));
    if !hooks.is_object() {
        *hooks = json!({});
    }
    let events = hooks.as_object_mut()?;
    let entries = events.entry(event).or_insert_with(|| json!([]));
    if !entries.is_array() {
        *entries = json!([]);
    }
    entries.as_array_mut()
}

/// Installs the Stop hook (and the SessionStart hook with `autostart`).
/// Re-running on a populated settings file does not duplicate entries.
/// Returns `(changed, message)`.
pub fn install_hooks(settings_path: &Path, autostart: bool) -> Result<(bool, String)> {
    let mut settings = read_settings(settings_path)?;

    let mut stop_added = false;
    if let Some(stop_entries) = event_entries(&mut settings, "Stop") {
        if find_marked_entry(stop_entries, STOP_MARKER).is_none() {
            stop_entries.push(json!({
                "matcher": "",
                "hooks": [{"type": "command", "command": hook_command(STOP_MARKER)}],
            }));
            stop_added = true;
        }
    }

    let mut session_start_added = false;
    if autostart {
        if let Some(ss_entries) = event_entries(&mut settings, "SessionStart") {
            if find_marked_entry(ss_entries, SESSION_START_MARKER).is_none() {
                ss_entries.push(json!({
                    "matcher": "",
                    "hooks": [{"type": "command", "command": hook_command(SESSION_START_MARKER)}],
                }));
                session_start_added = true;
            }
        }
    }

    if !stop_added && !session_start_added {
        let message = if autostart {
            "Memory Bank hooks already installed.".to_string()
        } else {
            "Memory Bank hook already installed.".to_string()
        };
        return Ok((false, message));
    }

    write_settings(settings_path, &settings)?;

    let message = match (stop_added, session_start_added) {
        (true, true) => "Memory Bank hooks installed (Stop + SessionStart).".to_string(),
        (false, true) => "Memory Bank SessionStart hook installed.".to_string(),
        _ => "Memory Bank hook installed.".to_string(),
    };
    Ok((true, message))
}

/// Removes both of our hooks. Returns `(removed_any, message)`.
pub fn uninstall_hooks(settings_path: &Path) -> Result<(bool, String)> {
    if !settings_path.exists() {
        return Ok((false, "Memory Bank hook not found.".to_string()));
    }

    let mut settings = read_settings(settings_path)?;
    let mut removed_any = false;

    for (event, marker) in [("Stop", STOP_MARKER), ("SessionStart", SESSION_START_MARKER)] {
        let Some(entries) = settings
            .get_mut("hooks")
            .and_then(|h| h.get_mut(event))
            .and_then(Value::as_array_mut)
        else {
            continue;
        };
        if let Some(idx) = find_marked_entry(entries, marker) {
            entries.remove(idx);
            removed_any = true;
        }
        let now_empty = entries.is_empty();
        if now_empty {
            if let Some(hooks) = settings.get_mut("hooks").and_then(Value::as_object_mut) {
                hooks.remove(event);
            }
        }
    }

    if !removed_any {
        return Ok((false, "Memory Bank hook not found.".to_string()));
    }

    // Drop the hooks object entirely once empty.
    let hooks_empty = settings
        .get("hooks")
        .and_then(Value::as_object)
        .is_some_and(serde_json::Map::is_empty);
    if hooks_empty {
        if let Some(obj) = settings.as_object_mut() {
            obj.remove("hooks");
        }
    }

    write_settings(settings_path, &settings)?;
    Ok((true, "Memory Bank hooks uninstalled.".to_string()))
}

/// Reports installation status for both hooks.
pub fn hooks_status(settings_path: &Path) -> Result<HooksStatus> {
    let not_installed = HookStatus {
        installed: false,
        command: None,
    };

    if !settings_path.exists() {
        return Ok(HooksStatus {
            stop: not_installed.clone(),
            session_start: not_installed,
        });
    }

    let settings = read_settings(settings_path)?;
    let status_for = |event: &str, marker: &str| {
        settings
            .get("hooks")
            .and_then(|h| h.get(event))
            .and_then(Value::as_array)
            .and_then(|entries| marked_command(entries, marker))
            .map_or(
                HookStatus {
                    installed: false,
                    command: None,
                },
                |command| HookStatus {
                    installed: true,
                    command: Some(command),
                },
            )
    };

    Ok(HooksStatus {
        stop: status_for("Stop", STOP_MARKER),
        session_start: status_for("SessionStart", SESSION_START_MARKER),
    })
}
