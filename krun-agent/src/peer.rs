//! `peer` mode — pull the working set from a hub, verify, and apply.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use krun_core::{layout, Manifest};

use crate::apply::apply_manifest;
use crate::error::{io_err, AgentError};
use crate::mirror;
use crate::workset;

/// Poll the tracker for a manifest, download missing chunks (verified while
/// written), reconstitute the payload, then optionally mirror and clean up.
pub async fn run_peer(
    dir: &Path,
    tracker: &str,
    cleanup: bool,
    mirror_enabled: bool,
) -> Result<(), AgentError> {
    let chunks_dir = layout::chunks_dir(dir);
    let client = reqwest::Client::new();

    tracing::info!(tracker, "peer waiting for manifest");
    let manifest = poll_manifest(&client, tracker).await?;
    tracing::info!(chunks = manifest.chunks.len(), "manifest received, syncing");

    let missing = manifest.missing_chunks(&chunks_dir);
    download_missing(&client, tracker, &chunks_dir, missing).await?;

    let created = {
        let chunks_dir = chunks_dir.clone();
        let dir = dir.to_path_buf();
        let manifest = manifest.clone();
        tokio::task::spawn_blocking(move || apply_manifest(&chunks_dir, &dir, &manifest))
            .await
            .map_err(|e| AgentError::Task(e.to_string()))??
    };

    if mirror_enabled {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || mirror::reconcile(&dir, &created))
            .await
            .map_err(|e| AgentError::Task(e.to_string()))?;
    }

    if cleanup {
        tracing::info!("peer cleaning up artifacts");
        workset::cleanup(dir);
    }

    tracing::info!("peer sync finished successfully");
    Ok(())
}

/// Poll `<tracker>/manifest` until a well-formed manifest arrives.
async fn poll_manifest(client: &reqwest::Client, tracker: &str) -> Result<Manifest, AgentError> {
    let url = format!("{tracker}/manifest");
    let mut ticker = tokio::time::interval(layout::PEER_POLL_INTERVAL);
    loop {
        ticker.tick().await;
        match client.get(&url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                match resp.json::<Manifest>().await {
                    Ok(manifest) => return Ok(manifest),
                    Err(err) => {
                        tracing::debug!(error = %err, "manifest not yet well-formed");
                    }
                }
            }
            Ok(resp) => {
                tracing::debug!(status = %resp.status(), "manifest not ready");
            }
            Err(err) => {
                tracing::debug!(error = %err, "tracker not reachable yet");
            }
        }
    }
}

/// Download `missing` chunks with a bounded pool. The first failure fails
/// the sync; in-flight downloads finish (or fail) on their own.
async fn download_missing(
    client: &reqwest::Client,
    tracker: &str,
    chunks_dir: &Path,
    missing: Vec<String>,
) -> Result<(), AgentError> {
    let semaphore = Arc::new(Semaphore::new(layout::PEER_DOWNLOAD_PARALLELISM));
    let mut tasks = JoinSet::new();

    for hash in missing {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AgentError::Task(e.to_string()))?;
        let client = client.clone();
        let tracker = tracker.to_string();
        let chunks_dir = chunks_dir.to_path_buf();
        tasks.spawn(async move {
            let _permit = permit;
            download_chunk(&client, &tracker, &hash, &chunks_dir).await
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    tracing::warn!(error = %err, "additional chunk download failure");
                }
            }
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(AgentError::Task(err.to_string()));
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Fetch one chunk into `<hash>.tmp`, hashing while writing; rename into
/// place only on a verified digest. No corrupt blob ever lands under a hash
/// name, and no temp file survives a failure.
async fn download_chunk(
    client: &reqwest::Client,
    tracker: &str,
    hash: &str,
    chunks_dir: &Path,
) -> Result<(), AgentError> {
    let mut response = client
        .get(format!("{tracker}/chunks/{hash}"))
        .send()
        .await?;
    if response.status() != reqwest::StatusCode::OK {
        return Err(AgentError::Download {
            hash: hash.to_string(),
            status: response.status().as_u16(),
        });
    }

    let tmp = chunks_dir.join(format!("{hash}.tmp"));
    let result = write_and_verify(&mut response, &tmp, hash).await;
    if let Err(err) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }

    let target = chunks_dir.join(hash);
    if let Err(err) = tokio::fs::rename(&tmp, &target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_err(&target, err));
    }
    Ok(())
}

async fn write_and_verify(
    response: &mut reqwest::Response,
    tmp: &Path,
    hash: &str,
) -> Result<(), AgentError> {
    let mut file = tokio::fs::File::create(tmp)
        .await
        .map_err(|e| io_err(tmp, e))?;
    let mut hasher = Sha256::new();

    while let Some(bytes) = response.chunk().await? {
        hasher.update(&bytes);
        file.write_all(&bytes).await.map_err(|e| io_err(tmp, e))?;
    }
    file.flush().await.map_err(|e| io_err(tmp, e))?;
    drop(file);

    let got = hex::encode(hasher.finalize());
    if got != hash {
        return Err(AgentError::Integrity {
            expected: hash.to_string(),
            got,
        });
    }
    Ok(())
}
