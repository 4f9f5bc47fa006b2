//! Content-defined chunking of the packed stream.
//!
//! The splitter parameters are pinned: changing them moves every chunk
//! boundary and collapses incremental-sync reuse across releases.

use std::io::Write;
use std::path::Path;

use fastcdc::v2020::StreamCDC;
use sha2::{Digest, Sha256};

use krun_core::Manifest;

use crate::error::{io_err, SyncError};
use crate::pack;
use crate::pipe::{byte_pipe, ByteReader};

/// Pinned splitter bounds. Do not change across released versions.
pub const CHUNK_MIN_SIZE: u32 = 512 * 1024;
pub const CHUNK_AVG_SIZE: u32 = 1024 * 1024;
pub const CHUNK_MAX_SIZE: u32 = 8 * 1024 * 1024;

/// Frames buffered between the tar producer and the splitter.
const PIPE_DEPTH: usize = 32;

/// Pack `src`, split the stream into content-defined chunks, persist each
/// chunk under `chunks_dir` keyed by its hex SHA-256, and return the ordered
/// manifest.
///
/// Blocking; run under `spawn_blocking` from async contexts.
pub fn generate_manifest(
    src: &Path,
    exclude: Option<&regex::Regex>,
    chunks_dir: &Path,
) -> Result<Manifest, SyncError> {
    let (writer, reader) = byte_pipe(PIPE_DEPTH);

    std::thread::scope(|scope| {
        let producer = scope.spawn(move || {
            let mut writer = writer;
            match pack::make_tar(src, &mut writer, exclude) {
                Ok(()) => Ok(()),
                Err(err) => {
                    // The reader must see this as pipe closure with an error,
                    // not a clean EOF of a shorter stream.
                    let message = err.to_string();
                    writer.close_with_error(message);
                    Err(err)
                }
            }
        });

        let split_result = split_and_store(reader, chunks_dir);
        let pack_result = producer
            .join()
            .map_err(|_| SyncError::Task("tar producer panicked".to_string()))?;

        match (pack_result, split_result) {
            (Ok(()), result) => result,
            // A splitter abort breaks the packer's pipe; that broken-pipe
            // symptom must not mask the splitter's own failure.
            (Err(pack_err), Err(split_err)) if is_broken_pipe(&pack_err) => Err(split_err),
            (Err(pack_err), _) => Err(pack_err),
        }
    })
}

fn is_broken_pipe(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::Io { source, .. } if source.kind() == std::io::ErrorKind::BrokenPipe
    )
}

fn split_and_store(reader: ByteReader, chunks_dir: &Path) -> Result<Manifest, SyncError> {
    let splitter = StreamCDC::new(reader, CHUNK_MIN_SIZE, CHUNK_AVG_SIZE, CHUNK_MAX_SIZE);

    let mut manifest = Manifest::default();
    for chunk in splitter {
        let chunk = chunk?;
        let hash = hex::encode(Sha256::digest(&chunk.data));
        write_chunk(chunks_dir, &hash, &chunk.data)?;
        manifest.push(hash, chunk.length as u64);
    }
    Ok(manifest)
}

/// Persist one chunk blob under its hash name, idempotently.
///
/// Concurrent writers race safely: each writes a uniquely named temp file and
/// renames it into place, so partial bytes never appear under a hash name.
pub fn write_chunk(chunks_dir: &Path, hash: &str, data: &[u8]) -> Result<(), SyncError> {
    let path = chunks_dir.join(hash);
    if path.exists() {
        return Ok(());
    }

    let mut tmp = tempfile::NamedTempFile::new_in(chunks_dir).map_err(|e| io_err(chunks_dir, e))?;
    tmp.write_all(data).map_err(|e| io_err(tmp.path(), e))?;
    tmp.persist(&path).map_err(|e| io_err(&path, e.error))?;
    Ok(())
}
