//! Error types for Memory Bank operations.
//!
//! Every error maps to exactly one process exit code at the CLI boundary:
//! user and storage errors exit 1, Ollama service errors exit 2.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MbError>;

/// Top-level error for all Memory Bank operations.
#[derive(Debug, Error)]
pub enum MbError {
    /// Storage has not been initialized in the current project.
    #[error("Memory Bank not initialized. Run `mb init` first. (looked in {0})")]
    NotInitialized(PathBuf),

    /// A session id did not resolve to a session directory.
    #[error("Session {0} not found.")]
    UnknownSession(String),

    /// Invalid CLI input (empty query, bad flag combination, out-of-range value).
    #[error("{0}")]
    InvalidInput(String),

    /// A storage file exists but does not parse.
    #[error("Corrupt {path}: {message}")]
    CorruptStorage {
        /// File that failed to parse.
        path: PathBuf,
        /// Parser diagnostic.
        message: String,
    },

    /// Embedding/chat service failure (exit code 2).
    #[error(transparent)]
    Ollama(#[from] OllamaError),

    /// I/O failure outside the best-effort capture paths.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl MbError {
    /// Process exit code for this error at the CLI boundary.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Ollama(_) => 2,
            _ => 1,
        }
    }
}

/// Errors from the Ollama embed/chat endpoints.
#[derive(Debug, Error)]
pub enum OllamaError {
    /// The server did not accept a connection.
    #[error(
        "Cannot connect to Ollama at {base_url}.\n\
         This operation requires a running Ollama instance.\n\
         \x20 1. Install Ollama: https://ollama.com/download\n\
         \x20 2. Start the server: ollama serve\n\
         \x20 3. Pull the model: ollama pull {model}"
    )]
    NotRunning {
        /// Configured server URL.
        base_url: String,
        /// Model named in the remediation hint.
        model: String,
    },

    /// The server responded 404 for the requested model.
    #[error("Model '{model}' not found. Run: ollama pull {model}")]
    ModelNotFound {
        /// The missing model.
        model: String,
    },

    /// The request exceeded its timeout.
    #[error("Ollama {operation} request timed out")]
    Timeout {
        /// Which call timed out ("embed" or "chat").
        operation: String,
    },

    /// Any other HTTP-level failure.
    #[error("Ollama request failed: {0}")]
    Http(String),

    /// The response body did not have the expected shape.
    #[error("Unexpected Ollama response: {0}")]
    BadResponse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(MbError::InvalidInput("x".into()).exit_code(), 1);
        assert_eq!(MbError::UnknownSession("s".into()).exit_code(), 1);
        let svc = MbError::Ollama(OllamaError::Timeout {
            operation: "embed".into(),
        });
        assert_eq!(svc.exit_code(), 2);
    }

    #[test]
    fn test_not_running_message_names_remediation() {
        let err = OllamaError::NotRunning {
            base_url: "http://localhost:11434".into(),
            model: "nomic-embed-text".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ollama serve"));
        assert!(msg.contains("ollama pull nomic-embed-text"));
    }
}
