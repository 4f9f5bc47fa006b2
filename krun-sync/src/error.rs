//! Error types for krun-sync.

use std::path::PathBuf;

use thiserror::Error;

use krun_core::ManifestError;
use krun_exec::ExecError;

/// All errors that can arise from chunking and fleet synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Source-tree traversal failure.
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// The content-defined splitter failed (usually a wrapped read error
    /// from the tar producer propagated through the pipe).
    #[error("chunker error: {0}")]
    Chunker(#[from] fastcdc::v2020::Error),

    /// Manifest encode/decode failure.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// JSON error while decoding an agent reply.
    #[error("agent reply JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level exec failure.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// The agent helper failed on one endpoint.
    #[error("agent {mode} failed on {endpoint}: {detail}")]
    Agent {
        endpoint: String,
        mode: &'static str,
        detail: String,
    },

    /// The hub never reported a listening address.
    #[error("hub start failed: {0}")]
    HubStart(String),

    /// A fleet sync was requested with no endpoints.
    #[error("no endpoints to sync")]
    NoEndpoints,

    /// A background task died before reporting a result.
    #[error("task failure: {0}")]
    Task(String),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
