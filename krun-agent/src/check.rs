//! `check` mode — diff a manifest against the local chunk store.

use std::io::{Read, Write};
use std::path::Path;

use krun_core::Manifest;

use crate::error::{io_err, AgentError};

/// Read a manifest JSON from `input` and write the JSON array of absent
/// chunk hashes to `output`. No side effects on the working set.
pub fn run_check(
    input: impl Read,
    mut output: impl Write,
    chunks_dir: &Path,
) -> Result<(), AgentError> {
    let manifest = Manifest::from_reader(input)?;
    let missing = manifest.missing_chunks(chunks_dir);
    serde_json::to_writer(&mut output, &missing)?;
    output.write_all(b"\n").map_err(|e| io_err("stdout", e))?;
    output.flush().map_err(|e| io_err("stdout", e))?;
    Ok(())
}
