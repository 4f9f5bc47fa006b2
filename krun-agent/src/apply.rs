//! Manifest apply — reconstitute the payload tree from chunk blobs.
//!
//! The chunk blobs, concatenated in manifest order, are the packed tar
//! stream; extracting it into the destination recreates the payload. Every
//! entry name is sanitized before any byte is written: nothing escapes the
//! destination root.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tar::EntryType;

use krun_core::Manifest;

use crate::error::{io_err, AgentError};

/// Extract the manifest's payload into `dest`, returning every path created
/// (files and directories) for the mirror reconciler.
pub fn apply_manifest(
    chunks_dir: &Path,
    dest: &Path,
    manifest: &Manifest,
) -> Result<Vec<PathBuf>, AgentError> {
    let stream = ChunkStream::new(chunks_dir, manifest);
    let mut archive = tar::Archive::new(stream);

    let mut created = Vec::new();
    for entry in archive.entries().map_err(|e| io_err(chunks_dir, e))? {
        let mut entry = entry.map_err(|e| io_err(chunks_dir, e))?;
        let raw = entry.path().map_err(|e| io_err(chunks_dir, e))?.into_owned();

        let Some(rel) = sanitize_entry_path(&raw) else {
            tracing::warn!(name = %raw.display(), "skipping suspicious tar entry");
            continue;
        };
        let target = dest.join(&rel);

        match entry.header().entry_type() {
            EntryType::Directory => {
                std::fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
                created.push(target);
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
                }
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&target)
                    .map_err(|e| io_err(&target, e))?;
                std::io::copy(&mut entry, &mut file).map_err(|e| io_err(&target, e))?;
                set_mode(&target, entry.header().mode().unwrap_or(0o644))?;
                created.push(target);
            }
            other => {
                // Symlinks, links, devices: header-only entries, nothing to
                // materialize.
                tracing::debug!(name = %rel.display(), kind = ?other, "skipping non-regular entry");
            }
        }
    }
    Ok(created)
}

/// Accept an entry path only if every component is a normal name: no
/// absolute paths, no `..`, no `.`, no prefixes.
pub fn sanitize_entry_path(raw: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(clean)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), AgentError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), AgentError> {
    Ok(())
}

/// Sequential reader over the manifest's chunk blobs in order.
struct ChunkStream<'a> {
    chunks_dir: &'a Path,
    manifest: &'a Manifest,
    index: usize,
    current: Option<File>,
}

impl<'a> ChunkStream<'a> {
    fn new(chunks_dir: &'a Path, manifest: &'a Manifest) -> Self {
        Self {
            chunks_dir,
            manifest,
            index: 0,
            current: None,
        }
    }
}

impl Read for ChunkStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if let Some(file) = &mut self.current {
                let n = file.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }
            let Some(chunk) = self.manifest.chunks.get(self.index) else {
                return Ok(0);
            };
            self.index += 1;
            let path = self.chunks_dir.join(&chunk.hash);
            self.current = Some(File::open(&path).map_err(|e| {
                std::io::Error::new(e.kind(), format!("chunk {}: {e}", chunk.hash))
            })?);
        }
    }
}
