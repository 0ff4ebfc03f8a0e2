//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Memory Bank: capture, search, and restore LLM session context.
///
/// Captures interactive sessions through a PTY wrapper or the external AI
/// CLI's hooks, extracts searchable chunks and artifacts, and synthesizes
/// token-budgeted context packs.
#[derive(Parser, Debug)]
#[command(name = "mb")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize Memory Bank storage in the current project.
    ///
    /// Creates `.memory-bank/` and appends it to `.gitignore`. Idempotent.
    #[command(after_help = r#"Examples:
  mb init                        # Initialize in the current directory
"#)]
    Init,

    /// Launch a command inside the PTY wrapper with session capture.
    ///
    /// The child behaves exactly as under a real terminal; sanitized
    /// events are captured transparently. Exits with the child's code.
    #[command(after_help = r#"Examples:
  mb run -- claude               # Capture a Claude Code session
  mb run -- make test            # Capture any interactive command
"#)]
    Run {
        /// Command and arguments to execute.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        child_cmd: Vec<String>,
    },

    /// List all recorded sessions, newest first.
    Sessions,

    /// Delete a session by ID and clear the stale index.
    Delete {
        /// Session ID to delete.
        session_id: String,
    },

    /// Semantic search across captured sessions and artifacts.
    ///
    /// Embeds the query and runs a cosine search over the vector index,
    /// with an optional LLM rerank pass. Requires a running Ollama.
    #[command(after_help = r#"Examples:
  mb search "error handling"                # Top 5 results
  mb search "auth flow" --top 10            # More results
  mb search "deploy steps" --type plan      # Only plan artifacts
  mb search "flaky test" --rerank           # LLM-reranked relevance
  mb search "old decision" --no-decay       # Disable freshness boost
  mb search "config" --global --json        # All registered projects
"#)]
    Search {
        /// Search query text.
        query: String,

        /// Number of results to return.
        #[arg(long, default_value = "5")]
        top: usize,

        /// Filter results by source type.
        #[arg(long = "type", value_parser = ["session", "plan", "todo", "task"])]
        result_type: Option<String>,

        /// Use the LLM reranker for better relevance.
        #[arg(long)]
        rerank: bool,

        /// Disable the temporal decay boost for this search.
        #[arg(long)]
        no_decay: bool,

        /// Search across all registered projects.
        #[arg(long = "global")]
        global: bool,

        /// Output results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate a context pack within a token budget.
    #[command(after_help = r#"Examples:
  mb pack                                   # 6000-token XML pack
  mb pack --budget 2000 --format md         # Compact Markdown
  mb pack --mode debug                      # Failure-centric allocation
  mb pack --out context.xml                 # Write to a file
"#)]
    Pack {
        /// Token budget for the context pack.
        #[arg(long, default_value = "6000")]
        budget: usize,

        /// Output format.
        #[arg(long, value_parser = ["xml", "json", "md"], default_value = "xml")]
        format: String,

        /// Write output to a file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Pack mode: auto (infer), debug, build, explore.
        #[arg(long, value_parser = ["auto", "debug", "build", "explore"], default_value = "auto")]
        mode: String,
    },

    /// Import historical Claude Code sessions and artifacts.
    #[command(name = "import")]
    Import {
        /// Show what would be imported without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Display the session graph with episode classification and errors.
    Graph {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Detect and apply storage schema migrations.
    Migrate,

    /// Rebuild the embedding index from all chunks.
    Reindex,

    /// Manage Claude Code hooks for automatic session capture.
    #[command(subcommand)]
    Hooks(HooksCommands),

    /// View and manage registered Memory Bank projects.
    Projects {
        /// Output as JSON.
        #[arg(long)]
        json: bool,

        /// Optional subcommand (e.g. remove).
        #[command(subcommand)]
        command: Option<ProjectsCommands>,
    },

    /// Stop-hook entry point; reads the hook payload from stdin.
    #[command(name = "hook-stop", hide = true)]
    HookStop,

    /// SessionStart-hook entry point; reads the hook payload from stdin.
    #[command(name = "hook-session-start", hide = true)]
    HookSessionStart,
}

/// Hook management subcommands.
#[derive(Subcommand, Debug)]
pub enum HooksCommands {
    /// Install the Stop hook into Claude Code settings.
    Install {
        /// Also install the SessionStart hook for automatic context
        /// injection at session startup.
        #[arg(long)]
        autostart: bool,
    },

    /// Remove Memory Bank hooks from Claude Code settings.
    Uninstall,

    /// Check whether Memory Bank hooks are installed.
    Status,
}

/// Project registry subcommands.
#[derive(Subcommand, Debug)]
pub enum ProjectsCommands {
    /// Remove a project from the global registry.
    Remove {
        /// Project path to remove.
        path: String,
    },
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parse() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_trailing_args() {
        let cli = Cli::parse_from(["mb", "run", "--", "echo", "-n", "hi"]);
        match cli.command {
            Commands::Run { child_cmd } => {
                assert_eq!(child_cmd, vec!["echo", "-n", "hi"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_search_defaults() {
        let cli = Cli::parse_from(["mb", "search", "query text"]);
        match cli.command {
            Commands::Search {
                query,
                top,
                result_type,
                rerank,
                no_decay,
                global,
                json,
            } => {
                assert_eq!(query, "query text");
                assert_eq!(top, 5);
                assert!(result_type.is_none());
                assert!(!rerank && !no_decay && !global && !json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_pack_defaults() {
        let cli = Cli::parse_from(["mb", "pack"]);
        match cli.command {
            Commands::Pack {
                budget,
                format,
                out,
                mode,
            } => {
                assert_eq!(budget, 6000);
                assert_eq!(format, "xml");
                assert!(out.is_none());
                assert_eq!(mode, "auto");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_search_type_rejected() {
        assert!(Cli::try_parse_from(["mb", "search", "q", "--type", "bogus"]).is_err());
    }
}
