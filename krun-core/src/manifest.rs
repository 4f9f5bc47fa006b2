//! Chunk manifests — the ordered recipe for a synced byte stream.
//!
//! A manifest is an ordered list of `(hash, size)` entries whose blobs,
//! concatenated in order, reconstitute the packed tar stream exactly. The
//! hash is authoritative; the size is informational. The canonical encoding
//! is compact `serde_json`, so serialize → parse → serialize is
//! byte-identical.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ManifestError};

/// One chunk reference: hex lowercase SHA-256 plus the blob length in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub hash: String,
    #[serde(default)]
    pub size: u64,
}

/// The ordered list of chunks describing one packed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub chunks: Vec<ChunkInfo>,
}

impl Manifest {
    /// Append a chunk reference. Order is significant: entries are emitted
    /// in stream order and replayed in the same order on apply.
    pub fn push(&mut self, hash: String, size: u64) {
        self.chunks.push(ChunkInfo { hash, size });
    }

    /// Canonical compact JSON bytes.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn from_reader(reader: impl Read) -> Result<Self, ManifestError> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Load a manifest from `path`.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let bytes = std::fs::read(path).map_err(|e| io_err(path, e))?;
        Self::from_slice(&bytes)
    }

    /// Write the manifest to `path` atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let bytes = self.to_canonical_json()?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(path, e));
        }
        Ok(())
    }

    /// Hashes referenced by this manifest that have no blob under
    /// `chunks_dir`, de-duplicated, in first-reference order.
    pub fn missing_chunks(&self, chunks_dir: &Path) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for chunk in &self.chunks {
            if !seen.insert(chunk.hash.as_str()) {
                continue;
            }
            if !chunks_dir.join(&chunk.hash).exists() {
                missing.push(chunk.hash.clone());
            }
        }
        missing
    }

    /// Total payload size in bytes, per the informational sizes.
    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn sample() -> Manifest {
        let mut m = Manifest::default();
        m.push("aa".repeat(32), 1024);
        m.push("bb".repeat(32), 2048);
        m
    }

    #[test]
    fn canonical_json_round_trips_byte_identically() {
        let m = sample();
        let first = m.to_canonical_json().expect("encode");
        let parsed = Manifest::from_slice(&first).expect("decode");
        let second = parsed.to_canonical_json().expect("re-encode");
        assert_eq!(first, second);
        assert_eq!(parsed, m);
    }

    #[test]
    fn canonical_json_shape_matches_wire_contract() {
        let mut m = Manifest::default();
        m.push("ab".repeat(32), 7);
        let json = String::from_utf8(m.to_canonical_json().expect("encode")).unwrap();
        assert_eq!(
            json,
            format!(r#"{{"chunks":[{{"hash":"{}","size":7}}]}}"#, "ab".repeat(32))
        );
    }

    #[test]
    fn missing_size_field_defaults_to_zero() {
        let m = Manifest::from_slice(br#"{"chunks":[{"hash":"deadbeef"}]}"#).expect("decode");
        assert_eq!(m.chunks[0].size, 0);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let m = Manifest::from_slice(br#"{"chunks":[],"version":99}"#).expect("decode");
        assert!(m.chunks.is_empty());
    }

    #[test]
    fn missing_chunks_reports_absent_blobs_once() {
        let dir = TempDir::new().expect("tempdir");
        let present = "cc".repeat(32);
        fs::write(dir.path().join(&present), b"blob").expect("write blob");

        let mut m = Manifest::default();
        m.push(present.clone(), 4);
        m.push("dd".repeat(32), 8);
        m.push("dd".repeat(32), 8);

        let missing = m.missing_chunks(dir.path());
        assert_eq!(missing, vec!["dd".repeat(32)]);
    }

    #[test]
    fn save_is_atomic_and_leaves_no_temp_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("manifest.json");
        let m = sample();
        m.save(&path).expect("save");

        let loaded = Manifest::load(&path).expect("load");
        assert_eq!(loaded, m);
        assert!(
            !path.with_extension("json.tmp").exists(),
            "temp file should be renamed away"
        );
    }
}
