//! Mirror reconciler — make the payload equal the manifest, not a superset.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use krun_core::layout;

/// Delete everything under `dest` that the latest apply did not create.
///
/// The keep-set is `created` plus every ancestor directory of a created path
/// plus the internal working-set paths. A directory absent from the keep-set
/// has no kept descendants (ancestors were added), so its whole subtree goes
/// at once. Deletion is best-effort: failures are logged and the sync
/// continues.
pub fn reconcile(dest: &Path, created: &[PathBuf]) {
    let chunks_dir = layout::chunks_dir(dest);
    let mut keep: HashSet<PathBuf> = created.iter().cloned().collect();
    keep.insert(chunks_dir.clone());
    keep.insert(layout::manifest_path(dest));
    for path in created {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == dest || d.as_os_str().is_empty() {
                break;
            }
            keep.insert(d.to_path_buf());
            dir = d.parent();
        }
    }

    let mut walker = walkdir::WalkDir::new(dest).into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "mirror walk error");
                continue;
            }
        };
        let path = entry.path();
        if path == dest {
            continue;
        }
        // Never walk into the chunk store; it is managed separately.
        if path == chunks_dir {
            walker.skip_current_dir();
            continue;
        }
        if keep.contains(path) {
            continue;
        }

        if entry.file_type().is_dir() {
            tracing::info!(path = %path.display(), "removing extraneous directory");
            if let Err(err) = std::fs::remove_dir_all(path) {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove directory");
            }
            walker.skip_current_dir();
        } else {
            tracing::info!(path = %path.display(), "removing extraneous file");
            if let Err(err) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn removes_extraneous_files_and_directories() {
        let dest = TempDir::new().expect("dest");
        fs::create_dir_all(layout::chunks_dir(dest.path())).unwrap();
        fs::write(layout::chunks_dir(dest.path()).join("aa".repeat(32)), b"blob").unwrap();
        fs::write(layout::manifest_path(dest.path()), b"{}").unwrap();

        fs::write(dest.path().join("keep.txt"), b"keep me").unwrap();
        fs::write(dest.path().join("extra.txt"), b"should be deleted").unwrap();
        fs::create_dir_all(dest.path().join("extra_dir")).unwrap();
        fs::write(dest.path().join("extra_dir/file.txt"), b"should be deleted").unwrap();

        reconcile(dest.path(), &[dest.path().join("keep.txt")]);

        assert!(dest.path().join("keep.txt").exists());
        assert!(!dest.path().join("extra.txt").exists());
        assert!(!dest.path().join("extra_dir").exists());
        assert!(layout::manifest_path(dest.path()).exists());
        assert!(layout::chunks_dir(dest.path()).join("aa".repeat(32)).exists());
    }

    #[test]
    fn partially_kept_directories_survive() {
        let dest = TempDir::new().expect("dest");
        fs::create_dir_all(dest.path().join("shared")).unwrap();
        fs::write(dest.path().join("shared/kept.txt"), b"kept").unwrap();
        fs::write(dest.path().join("shared/stale.txt"), b"stale").unwrap();

        reconcile(dest.path(), &[dest.path().join("shared/kept.txt")]);

        assert!(dest.path().join("shared/kept.txt").exists());
        assert!(!dest.path().join("shared/stale.txt").exists());
        assert!(dest.path().join("shared").is_dir());
    }

    #[test]
    fn empty_keep_set_clears_the_payload() {
        let dest = TempDir::new().expect("dest");
        fs::write(dest.path().join("old.txt"), b"old").unwrap();

        reconcile(dest.path(), &[]);
        assert!(!dest.path().join("old.txt").exists());
        assert!(dest.path().exists(), "destination root is never removed");
    }
}
