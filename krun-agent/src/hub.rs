//! `hub` mode — serve the working set over HTTP to peers.
//!
//! Lifecycle protocol: the orchestrator holds our stdin open for as long as
//! the hub should live. Stdin EOF is graceful shutdown; SIGINT/SIGTERM is
//! the hard path. Either way the working set is removed on exit.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use krun_core::layout;

use crate::error::{io_err, AgentError};
use crate::signals;
use crate::workset;

#[derive(Clone)]
struct HubState {
    dir: Arc<PathBuf>,
}

/// The hub's route surface: `GET /manifest`, `GET /chunks/:hash`, 404
/// otherwise. Factored out so tests can serve it on their own listener.
pub fn router(dir: &Path) -> Router {
    Router::new()
        .route("/manifest", get(serve_manifest))
        .route("/chunks/:hash", get(serve_chunk))
        .with_state(HubState {
            dir: Arc::new(dir.to_path_buf()),
        })
}

async fn serve_manifest(State(state): State<HubState>) -> Response {
    match tokio::fs::read(layout::manifest_path(&state.dir)).await {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_chunk(State(state): State<HubState>, UrlPath(hash): UrlPath<String>) -> Response {
    // Non-hex names are not chunks; this also closes the traversal door.
    if !layout::is_chunk_name(&hash) {
        return StatusCode::NOT_FOUND.into_response();
    }
    match tokio::fs::read(layout::chunks_dir(&state.dir).join(&hash)).await {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Bind, announce the address on stdout, and serve until shutdown.
pub async fn run_hub(dir: &Path, port: u16) -> Result<(), AgentError> {
    let app = router(dir);

    let bind_addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| AgentError::Bind {
            addr: bind_addr.clone(),
            source: e,
        })?;
    let addr = listener.local_addr().map_err(|e| AgentError::Bind {
        addr: bind_addr,
        source: e,
    })?;

    // Discovery sentinel for the orchestrator. Must be flushed before we
    // start serving, or a peer can reach us before the orchestrator has
    // learned the port.
    println!("{}{addr}", layout::HUB_SENTINEL);
    std::io::stdout()
        .flush()
        .map_err(|e| io_err("stdout", e))?;

    tracing::info!(%addr, "hub serving");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_trigger())
        .await;

    tracing::info!("hub cleaning up artifacts");
    workset::cleanup(dir);

    result.map_err(AgentError::Serve)
}

async fn shutdown_trigger() {
    tokio::select! {
        _ = stdin_eof() => {
            tracing::info!("stdin closed, shutting down hub");
        }
        _ = signals::terminated() => {
            tracing::info!("signal received, shutting down hub");
        }
    }
}

async fn stdin_eof() {
    let _ = tokio::task::spawn_blocking(|| {
        let mut stdin = std::io::stdin().lock();
        let _ = std::io::copy(&mut stdin, &mut std::io::sink());
    })
    .await;
}
