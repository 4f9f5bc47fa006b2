//! Deterministic tar packing of a local source tree.
//!
//! Traversal is lexical within each directory, so identical source trees
//! produce byte-identical tar streams across invocations. The chunker's
//! delta detection depends on that stability.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use regex::Regex;
use tar::{Builder, EntryType, Header, HeaderMode};
use walkdir::WalkDir;

use crate::error::{io_err, SyncError};

/// Walk `src` and write a tar archive to `writer`.
///
/// A directory source is stored relative to itself (no `.` entry); a file
/// source is stored under its basename. `exclude` is matched against the
/// relative path: a matching directory prunes its whole subtree, a matching
/// file is omitted. Non-regular entries get a header but no body. Writer
/// errors propagate, so a downstream pipe closure fails the walk fast.
pub fn make_tar<W: Write>(
    src: &Path,
    writer: W,
    exclude: Option<&Regex>,
) -> Result<(), SyncError> {
    let meta = std::fs::metadata(src).map_err(|e| io_err(src, e))?;

    let mut builder = Builder::new(writer);
    builder.follow_symlinks(false);

    if meta.is_dir() {
        pack_tree(&mut builder, src, exclude)?;
    } else {
        let name = src
            .file_name()
            .ok_or_else(|| io_err(src, std::io::Error::other("source has no file name")))?;
        append_file(&mut builder, src, Path::new(name), &meta)?;
    }

    let mut inner = builder.into_inner().map_err(|e| io_err(src, e))?;
    inner.flush().map_err(|e| io_err(src, e))?;
    Ok(())
}

fn pack_tree<W: Write>(
    builder: &mut Builder<W>,
    root: &Path,
    exclude: Option<&Regex>,
) -> Result<(), SyncError> {
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry?;
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        // The walk starts with the root itself; skip it so extraction does
        // not touch the destination root's own entry.
        if rel.as_os_str().is_empty() {
            continue;
        }

        let rel_str = rel.to_string_lossy();
        if let Some(pattern) = exclude {
            if pattern.is_match(&rel_str) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
        }

        let meta = entry.metadata()?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            let mut header = Header::new_gnu();
            header.set_metadata_in_mode(&meta, HeaderMode::Complete);
            header.set_entry_type(EntryType::Directory);
            builder
                .append_data(&mut header, rel, std::io::empty())
                .map_err(|e| io_err(entry.path(), e))?;
        } else if file_type.is_file() {
            append_file(builder, entry.path(), rel, &meta)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(|e| io_err(entry.path(), e))?;
            let mut header = Header::new_gnu();
            header.set_metadata_in_mode(&meta, HeaderMode::Complete);
            header.set_size(0);
            builder
                .append_link(&mut header, rel, &target)
                .map_err(|e| io_err(entry.path(), e))?;
        } else {
            // Sockets, fifos, devices: header only, no body.
            let mut header = Header::new_gnu();
            header.set_metadata_in_mode(&meta, HeaderMode::Complete);
            header.set_size(0);
            builder
                .append_data(&mut header, rel, std::io::empty())
                .map_err(|e| io_err(entry.path(), e))?;
        }
    }

    Ok(())
}

fn append_file<W: Write>(
    builder: &mut Builder<W>,
    path: &Path,
    name: &Path,
    meta: &std::fs::Metadata,
) -> Result<(), SyncError> {
    let mut header = Header::new_gnu();
    // Complete mode keeps the local mode bits, so executables stay
    // executable on extraction.
    header.set_metadata_in_mode(meta, HeaderMode::Complete);
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    builder
        .append_data(&mut header, name, file)
        .map_err(|e| io_err(path, e))?;
    Ok(())
}
