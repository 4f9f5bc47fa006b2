//! Working-set lifecycle under a destination directory.

use std::path::Path;

use krun_core::layout;

use crate::error::{io_err, AgentError};

/// Create the destination and chunk directories if absent.
pub fn ensure(dest: &Path) -> Result<(), AgentError> {
    std::fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;
    let chunks = layout::chunks_dir(dest);
    std::fs::create_dir_all(&chunks).map_err(|e| io_err(&chunks, e))?;
    Ok(())
}

/// Remove the manifest and chunk store, leaving the payload in place.
///
/// Best-effort: a half-removed working set is repaired by the next sync.
pub fn cleanup(dest: &Path) {
    let chunks = layout::chunks_dir(dest);
    if let Err(err) = std::fs::remove_dir_all(&chunks) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %chunks.display(), error = %err, "failed to remove chunk store");
        }
    }
    let manifest = layout::manifest_path(dest);
    if let Err(err) = std::fs::remove_file(&manifest) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %manifest.display(), error = %err, "failed to remove manifest");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn ensure_then_cleanup_leaves_payload_alone() {
        let dest = TempDir::new().expect("dest");
        ensure(dest.path()).expect("ensure");
        assert!(layout::chunks_dir(dest.path()).is_dir());

        std::fs::write(layout::manifest_path(dest.path()), b"{}").unwrap();
        std::fs::write(dest.path().join("payload.txt"), b"data").unwrap();

        cleanup(dest.path());
        assert!(!layout::chunks_dir(dest.path()).exists());
        assert!(!layout::manifest_path(dest.path()).exists());
        assert!(dest.path().join("payload.txt").exists());
    }
}
