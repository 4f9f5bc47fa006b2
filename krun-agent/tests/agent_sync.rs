//! End-to-end agent flows: hub serving, peer download + integrity, mirror
//! closure, and incremental chunk reuse over a counting hub.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::extract::Request;
use axum::middleware::{self, Next};

use krun_agent::{hub, ingest, peer, workset, AgentError};
use krun_core::{layout, Manifest};
use krun_sync::generate_manifest;

type RequestCounts = Arc<Mutex<HashMap<String, usize>>>;

async fn serve_hub(dir: &Path) -> (SocketAddr, RequestCounts) {
    let counts: RequestCounts = Arc::default();
    let recorder = counts.clone();

    let app = hub::router(dir).layer(middleware::from_fn(move |req: Request, next: Next| {
        let counts = recorder.clone();
        async move {
            *counts
                .lock()
                .unwrap()
                .entry(req.uri().path().to_string())
                .or_insert(0) += 1;
            next.run(req).await
        }
    }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, counts)
}

async fn chunk_source(src: PathBuf, chunks_dir: PathBuf) -> Manifest {
    tokio::task::spawn_blocking(move || generate_manifest(&src, None, &chunks_dir))
        .await
        .expect("chunking task")
        .expect("generate manifest")
}

/// A single-file tar payload stored as one chunk, the smallest useful hub
/// working set.
fn seed_hub_with_one_file(hub_dir: &Path, name: &str, body: &[u8]) {
    use sha2::{Digest, Sha256};

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, name, body).expect("append");
    let tar_bytes = builder.into_inner().expect("finish tar");

    let hash = hex::encode(Sha256::digest(&tar_bytes));
    fs::write(layout::chunks_dir(hub_dir).join(&hash), &tar_bytes).expect("chunk");

    let mut manifest = Manifest::default();
    manifest.push(hash, tar_bytes.len() as u64);
    manifest
        .save(&layout::manifest_path(hub_dir))
        .expect("manifest");
}

#[tokio::test]
async fn peer_pulls_applies_and_cleans_up() {
    let hub_dir = tempfile::TempDir::new().expect("hub dir");
    let peer_dir = tempfile::TempDir::new().expect("peer dir");
    workset::ensure(hub_dir.path()).expect("hub workset");
    workset::ensure(peer_dir.path()).expect("peer workset");

    seed_hub_with_one_file(hub_dir.path(), "test.txt", b"hello sync");
    let (addr, _) = serve_hub(hub_dir.path()).await;

    peer::run_peer(peer_dir.path(), &format!("http://{addr}"), true, false)
        .await
        .expect("peer sync");

    assert_eq!(
        fs::read(peer_dir.path().join("test.txt")).expect("extracted file"),
        b"hello sync"
    );
    assert!(
        !layout::chunks_dir(peer_dir.path()).exists(),
        "--cleanup removes the chunk store"
    );
    assert!(!layout::manifest_path(peer_dir.path()).exists());
}

#[tokio::test]
async fn corrupted_chunk_is_rejected_and_never_lands_on_disk() {
    let hub_dir = tempfile::TempDir::new().expect("hub dir");
    let peer_dir = tempfile::TempDir::new().expect("peer dir");
    workset::ensure(hub_dir.path()).expect("hub workset");
    workset::ensure(peer_dir.path()).expect("peer workset");

    // sha256("hello"), but the blob carries different bytes.
    let real_hash = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    fs::write(
        layout::chunks_dir(hub_dir.path()).join(real_hash),
        b"EVIL DATA",
    )
    .expect("corrupt chunk");
    let mut manifest = Manifest::default();
    manifest.push(real_hash.to_string(), 9);
    manifest
        .save(&layout::manifest_path(hub_dir.path()))
        .expect("manifest");

    let (addr, _) = serve_hub(hub_dir.path()).await;

    let err = peer::run_peer(peer_dir.path(), &format!("http://{addr}"), false, false)
        .await
        .expect_err("integrity failure");
    match err {
        AgentError::Integrity { expected, got } => {
            assert_eq!(expected, real_hash);
            assert_ne!(got, expected);
        }
        other => panic!("expected integrity error, got {other}"),
    }

    let peer_chunks = layout::chunks_dir(peer_dir.path());
    assert!(
        !peer_chunks.join(real_hash).exists(),
        "corrupted chunk must not exist on disk"
    );
    assert!(
        !peer_chunks.join(format!("{real_hash}.tmp")).exists(),
        "temp file must be removed on failure"
    );
}

#[tokio::test]
async fn incremental_sync_downloads_only_changed_chunks() {
    let hub_dir = tempfile::TempDir::new().expect("hub dir");
    let peer_dir = tempfile::TempDir::new().expect("peer dir");
    let src_dir = tempfile::TempDir::new().expect("src dir");
    workset::ensure(hub_dir.path()).expect("hub workset");
    workset::ensure(peer_dir.path()).expect("peer workset");

    // 100 files, ~50 KiB each, so the packed stream spans several chunks.
    let num_files = 100;
    for i in 0..num_files {
        let base = format!("content-{i}-");
        fs::write(
            src_dir.path().join(format!("file-{i}.txt")),
            base.repeat(5000),
        )
        .expect("source file");
    }

    let hub_chunks = layout::chunks_dir(hub_dir.path());
    let manifest1 = chunk_source(src_dir.path().to_path_buf(), hub_chunks.clone()).await;
    manifest1
        .save(&layout::manifest_path(hub_dir.path()))
        .expect("manifest 1");

    let (addr, counts) = serve_hub(hub_dir.path()).await;
    let tracker = format!("http://{addr}");

    peer::run_peer(peer_dir.path(), &tracker, false, false)
        .await
        .expect("initial sync");
    for chunk in &manifest1.chunks {
        assert!(
            layout::chunks_dir(peer_dir.path()).join(&chunk.hash).exists(),
            "chunk {} missing after initial sync",
            chunk.hash
        );
    }

    counts.lock().unwrap().clear();

    // Modify only the lexically-last file; the stream prefix is unchanged.
    fs::write(
        src_dir.path().join(format!("file-{}.txt", num_files - 1)),
        b"modified-content-at-the-end-plus-extra",
    )
    .expect("modify file");

    let manifest2 = chunk_source(src_dir.path().to_path_buf(), hub_chunks.clone()).await;
    manifest2
        .save(&layout::manifest_path(hub_dir.path()))
        .expect("manifest 2");

    peer::run_peer(peer_dir.path(), &tracker, false, false)
        .await
        .expect("incremental sync");

    let counts = counts.lock().unwrap();
    let downloaded = manifest2
        .chunks
        .iter()
        .filter(|c| {
            counts
                .get(&format!("/chunks/{}", c.hash))
                .copied()
                .unwrap_or(0)
                > 0
        })
        .count();

    assert!(downloaded > 0, "the changed tail must be re-downloaded");
    assert!(
        downloaded < manifest2.chunks.len(),
        "unchanged chunks must be reused ({downloaded} of {} downloaded)",
        manifest2.chunks.len()
    );

    let content = fs::read(peer_dir.path().join(format!("file-{}.txt", num_files - 1)))
        .expect("modified file on peer");
    assert!(
        content
            .windows(b"modified-content".len())
            .any(|w| w == b"modified-content"),
        "modified bytes must reach the peer"
    );
}

#[test]
fn ingest_with_mirror_makes_destination_equal_the_manifest() {
    let src_dir = tempfile::TempDir::new().expect("src dir");
    let staging = tempfile::TempDir::new().expect("staging");
    let dest = tempfile::TempDir::new().expect("dest");
    workset::ensure(dest.path()).expect("workset");

    fs::write(src_dir.path().join("keep.txt"), b"keep me").expect("keep");

    // Stray content from a previous sync.
    fs::write(dest.path().join("extra.txt"), b"should be deleted").expect("extra");
    fs::create_dir_all(dest.path().join("extra_dir")).expect("extra dir");
    fs::write(dest.path().join("extra_dir/file.txt"), b"should be deleted").expect("extra nested");

    let manifest =
        generate_manifest(src_dir.path(), None, staging.path()).expect("generate manifest");

    let mut builder = tar::Builder::new(Vec::new());
    let mut seen = std::collections::HashSet::new();
    for chunk in &manifest.chunks {
        if !seen.insert(chunk.hash.clone()) {
            continue;
        }
        let data = fs::read(staging.path().join(&chunk.hash)).expect("chunk blob");
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, &chunk.hash, data.as_slice())
            .expect("append chunk");
    }
    let manifest_bytes = manifest.to_canonical_json().expect("encode manifest");
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, layout::MANIFEST_FILE, manifest_bytes.as_slice())
        .expect("append manifest");
    let tar_bytes = builder.into_inner().expect("finish tar");

    ingest::run_ingest(tar_bytes.as_slice(), dest.path(), false, true).expect("ingest");

    assert_eq!(fs::read(dest.path().join("keep.txt")).unwrap(), b"keep me");
    assert!(!dest.path().join("extra.txt").exists(), "mirror deletes strays");
    assert!(!dest.path().join("extra_dir").exists());
    assert!(layout::chunks_dir(dest.path()).exists(), "internal paths kept");
    assert!(layout::manifest_path(dest.path()).exists());
}
