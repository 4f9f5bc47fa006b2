//! Leader-hub / follower-peer fleet synchronization.
//!
//! One invocation, one leader: `endpoints[0]`. The local tree is chunked and
//! uploaded to the leader over exec (`check` + `ingest`); with more than one
//! endpoint a hub is started on the leader, its ephemeral port discovered
//! from the stdout sentinel, and every follower runs `peer` against it in
//! parallel. The hub's stdin is its life-signal: closing it is the graceful
//! shutdown.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;

use krun_core::{layout, Endpoint, Manifest};
use krun_exec::transport::{OutputPipe, StdinPipe};
use krun_exec::{ExecError, ExecSession, StreamRequest, Transport};

use crate::chunker::generate_manifest;
use crate::error::{io_err, SyncError};
use crate::pipe::{byte_pipe, ByteWriter};

/// Frames buffered between the ingest-tar producer and the remote stdin.
const INGEST_PIPE_DEPTH: usize = 32;

/// Synchronize `src` to `dest` on every endpoint.
///
/// Single endpoint: plain local→leader sync with immediate cleanup. Multiple
/// endpoints: leader sync (keeping the working set), hub on the leader,
/// parallel peers, then hub shutdown. The first peer error is returned;
/// the rest are logged.
pub async fn sync_endpoints(
    transport: Arc<dyn Transport>,
    endpoints: &[Endpoint],
    src: &Path,
    dest: &Path,
    exclude: Option<&regex::Regex>,
    agent_path: &str,
) -> Result<(), SyncError> {
    let Some(leader) = endpoints.first() else {
        return Err(SyncError::NoEndpoints);
    };
    tracing::info!(leader = %leader.name, "selected leader endpoint");

    // A lone endpoint can drop its working set right after ingest. With
    // followers the leader must keep serving chunks; the hub removes the
    // working set when it shuts down.
    let cleanup_leader = endpoints.len() == 1;

    tracing::info!("syncing to leader");
    sync_local_to_leader(
        &transport,
        leader,
        src,
        dest,
        exclude,
        cleanup_leader,
        agent_path,
    )
    .await?;

    if endpoints.len() == 1 {
        return Ok(());
    }

    tracing::info!("starting hub on leader");
    let hub = start_hub(&transport, leader, dest, agent_path).await?;
    let hub_url = format!("http://{}", join_host_port(&leader.ip, hub.port));

    let peers = &endpoints[1..];
    tracing::info!(peers = peers.len(), url = %hub_url, "starting sync on peers");
    let result = run_peers(&transport, peers, dest, &hub_url, agent_path).await;

    hub.shutdown().await;

    if result.is_ok() {
        tracing::info!("fleet sync completed");
    }
    result
}

/// Chunk the local tree and upload it to the leader: local CDC split into a
/// staging directory, `check` for the leader's missing hashes, then `ingest`
/// streaming exactly those chunks plus the manifest.
pub async fn sync_local_to_leader(
    transport: &Arc<dyn Transport>,
    leader: &Endpoint,
    src: &Path,
    dest: &Path,
    exclude: Option<&regex::Regex>,
    cleanup: bool,
    agent_path: &str,
) -> Result<(), SyncError> {
    tracing::info!("chunking local files");
    let staging = tempfile::Builder::new()
        .prefix("krun-chunks-")
        .tempdir()
        .map_err(|e| io_err(std::env::temp_dir(), e))?;

    let manifest = {
        let src = src.to_path_buf();
        let exclude = exclude.cloned();
        let chunks_dir = staging.path().to_path_buf();
        tokio::task::spawn_blocking(move || generate_manifest(&src, exclude.as_ref(), &chunks_dir))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??
    };
    tracing::info!(chunks = manifest.chunks.len(), "local data split into chunks");

    tracing::info!("checking missing chunks on leader");
    let missing = check_remote(transport, leader, dest, &manifest, agent_path).await?;
    tracing::info!(missing = missing.len(), "leader missing chunks");

    tracing::info!("uploading data");
    ingest_remote(
        transport,
        leader,
        dest,
        &missing,
        staging.path(),
        &manifest,
        cleanup,
        agent_path,
    )
    .await
}

/// Run `agent --mode check` on the leader: manifest JSON in on stdin, JSON
/// array of absent hashes out on stdout.
async fn check_remote(
    transport: &Arc<dyn Transport>,
    leader: &Endpoint,
    dest: &Path,
    manifest: &Manifest,
    agent_path: &str,
) -> Result<Vec<String>, SyncError> {
    let payload = manifest.to_canonical_json()?;
    let argv = agent_argv(agent_path, "check", dest);

    let mut session = transport.open(leader, &argv, StreamRequest::all()).await?;
    let mut stdin = session.take_stdin()?;
    let mut stdout = session.take_stdout()?;
    let stderr = session.take_stderr()?;
    let stderr_task = tokio::spawn(capture_stderr(stderr, leader.name.clone()));

    stdin
        .write_all(&payload)
        .await
        .map_err(|e| stream_err(leader, e))?;
    stdin.shutdown().await.map_err(|e| stream_err(leader, e))?;
    drop(stdin);

    let mut reply = Vec::new();
    stdout
        .read_to_end(&mut reply)
        .await
        .map_err(|e| stream_err(leader, e))?;

    let wait_result = session.wait().await;
    let stderr_text = stderr_task.await.unwrap_or_default();
    if let Err(err) = wait_result {
        return Err(agent_error(leader, "check", &err, &stderr_text));
    }

    // Be liberal in what we accept: an empty missing list may arrive as
    // `null` from older agents.
    let missing: Option<Vec<String>> = serde_json::from_slice(&reply)?;
    Ok(missing.unwrap_or_default())
}

/// Run `agent --mode ingest` on the leader, streaming a tar of the missing
/// chunk blobs followed by the manifest entry. Backpressure comes from the
/// pipe: the producer cannot outrun the remote consumer.
#[allow(clippy::too_many_arguments)]
async fn ingest_remote(
    transport: &Arc<dyn Transport>,
    leader: &Endpoint,
    dest: &Path,
    missing: &[String],
    staging: &Path,
    manifest: &Manifest,
    cleanup: bool,
    agent_path: &str,
) -> Result<(), SyncError> {
    let mut argv = agent_argv(agent_path, "ingest", dest);
    if cleanup {
        argv.push("--cleanup".to_string());
    }

    let mut session = transport
        .open(
            leader,
            &argv,
            StreamRequest {
                stdin: true,
                stdout: false,
                stderr: true,
            },
        )
        .await?;
    let mut stdin = session.take_stdin()?;
    let stderr = session.take_stderr()?;
    let stderr_task = tokio::spawn(capture_stderr(stderr, leader.name.clone()));

    let (writer, mut reader) = byte_pipe(INGEST_PIPE_DEPTH);
    let producer = {
        let missing = missing.to_vec();
        let staging = staging.to_path_buf();
        let manifest_bytes = manifest.to_canonical_json()?;
        tokio::task::spawn_blocking(move || -> Result<(), SyncError> {
            let mut writer = writer;
            match write_ingest_tar(&mut writer, &missing, &staging, &manifest_bytes) {
                Ok(()) => Ok(()),
                Err(err) => {
                    writer.close_with_error(err.to_string());
                    Err(err)
                }
            }
        })
    };

    let mut pump_error: Option<std::io::Error> = None;
    while let Some(frame) = reader.next_chunk().await {
        match frame {
            Ok(data) => {
                if let Err(err) = stdin.write_all(&data).await {
                    pump_error = Some(err);
                    break;
                }
            }
            Err(err) => {
                pump_error = Some(err);
                break;
            }
        }
    }
    let _ = stdin.shutdown().await;
    drop(stdin);

    let wait_result = session.wait().await;
    let producer_result = producer
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?;
    let stderr_text = stderr_task.await.unwrap_or_default();

    // The remote's own account of a failure beats the local symptom (a
    // broken pipe from the producer or the pump).
    if let Err(err) = wait_result {
        return Err(agent_error(leader, "ingest", &err, &stderr_text));
    }
    producer_result?;
    if let Some(err) = pump_error {
        return Err(stream_err(leader, err));
    }
    Ok(())
}

fn write_ingest_tar(
    writer: &mut ByteWriter,
    missing: &[String],
    chunks_dir: &Path,
    manifest_bytes: &[u8],
) -> Result<(), SyncError> {
    let mut builder = tar::Builder::new(writer);

    for hash in missing {
        let path = chunks_dir.join(hash);
        let data = std::fs::read(&path).map_err(|e| io_err(&path, e))?;
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, hash, data.as_slice())
            .map_err(|e| io_err(&path, e))?;
    }

    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, layout::MANIFEST_FILE, manifest_bytes)
        .map_err(|e| io_err(layout::MANIFEST_FILE, e))?;

    builder
        .finish()
        .map_err(|e| io_err(layout::MANIFEST_FILE, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Hub lifecycle
// ---------------------------------------------------------------------------

struct HubHandle {
    stdin: StdinPipe,
    session: ExecSession,
    port: u16,
}

impl HubHandle {
    /// Close the hub's stdin (its shutdown protocol) and wait for it.
    async fn shutdown(self) {
        drop(self.stdin);
        if let Err(err) = self.session.wait().await {
            tracing::warn!(error = %err, "hub exited with error");
        }
    }
}

async fn start_hub(
    transport: &Arc<dyn Transport>,
    leader: &Endpoint,
    dest: &Path,
    agent_path: &str,
) -> Result<HubHandle, SyncError> {
    let mut argv = agent_argv(agent_path, "hub", dest);
    argv.extend(["--tracker-port".to_string(), "0".to_string()]);

    let mut session = transport.open(leader, &argv, StreamRequest::all()).await?;
    let stdin = session.take_stdin()?;
    let stdout = session.take_stdout()?;
    let stderr = session.take_stderr()?;
    tokio::spawn(capture_stderr(stderr, leader.name.clone()));

    let mut lines = BufReader::new(stdout).lines();
    let mut port = None;
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(idx) = line.find(layout::HUB_SENTINEL) {
            let addr = &line[idx + layout::HUB_SENTINEL.len()..];
            port = addr
                .rsplit(':')
                .next()
                .and_then(|p| p.trim().parse::<u16>().ok());
            break;
        }
    }

    let Some(port) = port else {
        drop(stdin);
        let _ = session.wait().await;
        return Err(SyncError::HubStart(
            "hub never reported a listening address".to_string(),
        ));
    };
    tracing::info!(port, "hub reported listening address");

    // Keep draining the hub's stdout so its pipe never wedges it.
    tokio::spawn(async move {
        let mut rest = lines.into_inner();
        let _ = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await;
    });

    Ok(HubHandle {
        stdin,
        session,
        port,
    })
}

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

async fn run_peers(
    transport: &Arc<dyn Transport>,
    peers: &[Endpoint],
    dest: &Path,
    hub_url: &str,
    agent_path: &str,
) -> Result<(), SyncError> {
    let mut tasks = JoinSet::new();
    for peer in peers {
        let transport = transport.clone();
        let peer = peer.clone();
        let mut argv = agent_argv(agent_path, "peer", dest);
        argv.extend([
            "--tracker".to_string(),
            hub_url.to_string(),
            "--cleanup".to_string(),
        ]);
        tasks.spawn(async move {
            let result = run_agent(&transport, &peer, &argv, "peer").await;
            (peer.name.clone(), result)
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((name, Err(err))) => {
                tracing::warn!(endpoint = %name, error = %err, "peer sync failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(SyncError::Task(err.to_string()));
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Run one agent exec to completion, capturing its stderr for diagnostics.
async fn run_agent(
    transport: &Arc<dyn Transport>,
    endpoint: &Endpoint,
    argv: &[String],
    mode: &'static str,
) -> Result<(), SyncError> {
    let mut session = transport
        .open(
            endpoint,
            argv,
            StreamRequest {
                stdin: false,
                stdout: false,
                stderr: true,
            },
        )
        .await?;
    let stderr = session.take_stderr()?;
    let stderr_task = tokio::spawn(capture_stderr(stderr, endpoint.name.clone()));

    let wait_result = session.wait().await;
    let stderr_text = stderr_task.await.unwrap_or_default();
    wait_result.map_err(|err| agent_error(endpoint, mode, &err, &stderr_text))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn agent_argv(agent_path: &str, mode: &str, dest: &Path) -> Vec<String> {
    vec![
        agent_path.to_string(),
        "--mode".to_string(),
        mode.to_string(),
        "--dir".to_string(),
        dest.display().to_string(),
    ]
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn stream_err(endpoint: &Endpoint, source: std::io::Error) -> SyncError {
    SyncError::Exec(ExecError::Stream {
        endpoint: endpoint.name.clone(),
        source,
    })
}

fn agent_error(
    endpoint: &Endpoint,
    mode: &'static str,
    err: &ExecError,
    stderr: &str,
) -> SyncError {
    let stderr = stderr.trim();
    let detail = if stderr.is_empty() {
        err.to_string()
    } else {
        format!("{err} (stderr: {stderr})")
    };
    SyncError::Agent {
        endpoint: endpoint.name.clone(),
        mode,
        detail,
    }
}

/// Forward an agent's stderr lines to tracing and keep them for error detail.
async fn capture_stderr(reader: OutputPipe, endpoint: String) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(endpoint = %endpoint, "{line}");
        if !collected.is_empty() {
            collected.push('\n');
        }
        collected.push_str(&line);
    }
    collected
}
