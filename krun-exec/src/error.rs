//! Error types for krun-exec.

use thiserror::Error;

/// All errors that can arise from remote execution.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Failed to launch the transport process.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote command terminated unsuccessfully.
    #[error("command failed on {endpoint}: {detail}")]
    CommandFailed { endpoint: String, detail: String },

    /// An I/O error on one of the exec streams.
    #[error("stream error on {endpoint}: {source}")]
    Stream {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// A stream was requested but the transport did not provide it.
    #[error("transport did not provide a {0} stream")]
    MissingStream(&'static str),

    /// Endpoint discovery failed.
    #[error("endpoint listing failed: {0}")]
    EndpointList(String),

    /// JSON error while decoding a transport response.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A background task died before reporting a result.
    #[error("task failure: {0}")]
    Task(String),

    /// The root context was cancelled (signal or deadline).
    #[error("operation cancelled")]
    Cancelled,
}
