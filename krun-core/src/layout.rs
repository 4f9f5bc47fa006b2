//! On-disk working-set layout under a sync destination.
//!
//! Every endpoint keeps the same quartet under `<dest>/`:
//!
//! ```text
//! <dest>/
//!   manifest.json      current manifest, replaced atomically
//!   krun-chunks/       flat chunk blobs keyed by hex SHA-256
//!   ...payload...      files reconstituted from the manifest
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the manifest inside the destination directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Directory name of the chunk store inside the destination directory.
pub const CHUNKS_DIR: &str = "krun-chunks";

/// Where the agent helper binary is expected to live on each endpoint.
pub const AGENT_PATH: &str = "/tmp/krun-agent";

/// Sentinel prefix the hub prints once its listener is bound.
pub const HUB_SENTINEL: &str = "Hub listening on ";

/// How often a peer polls the hub for the manifest.
pub const PEER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum in-flight chunk downloads per peer.
pub const PEER_DOWNLOAD_PARALLELISM: usize = 5;

pub fn manifest_path(dest: &Path) -> PathBuf {
    dest.join(MANIFEST_FILE)
}

pub fn chunks_dir(dest: &Path) -> PathBuf {
    dest.join(CHUNKS_DIR)
}

/// Whether `name` is a well-formed chunk file name: 64 lowercase hex chars.
pub fn is_chunk_name(name: &str) -> bool {
    name.len() == 64
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
