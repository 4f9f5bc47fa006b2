//! Error types for the agent helper.

use std::path::PathBuf;

use thiserror::Error;

use krun_core::ManifestError;

/// All errors that can arise from agent modes.
#[derive(Debug, Error)]
pub enum AgentError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest encode/decode failure.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// JSON error on the check reply.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client failure while talking to the hub.
    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The hub answered a chunk request with a non-OK status.
    #[error("chunk {hash} download failed: status {status}")]
    Download { hash: String, status: u16 },

    /// A downloaded chunk did not hash to its name.
    #[error("integrity check failed: expected {expected}, got {got}")]
    Integrity { expected: String, got: String },

    /// The hub listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The hub server failed while serving.
    #[error("hub server error: {0}")]
    Serve(#[source] std::io::Error),

    /// A background task died before reporting a result.
    #[error("task failure: {0}")]
    Task(String),

    /// A terminating signal ended the run.
    #[error("terminated by signal")]
    Terminated,
}

/// Convenience constructor for [`AgentError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> AgentError {
    AgentError::Io {
        path: path.into(),
        source,
    }
}
