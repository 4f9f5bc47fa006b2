//! # krun-sync
//!
//! The fleet file-synchronization engine:
//! - [`pack`] — deterministic tar packing with exclusion pruning
//! - [`pipe`] — bounded byte pipe bridging blocking producers to consumers
//! - [`chunker`] — content-defined chunking and idempotent chunk persistence
//! - [`fanout`] — local→leader sync plus hub/peer fan-out across a fleet
//!
//! Call [`fanout::sync_endpoints`] to push a local tree to every endpoint.

pub mod chunker;
pub mod error;
pub mod fanout;
pub mod pack;
pub mod pipe;

pub use chunker::{generate_manifest, CHUNK_AVG_SIZE, CHUNK_MAX_SIZE, CHUNK_MIN_SIZE};
pub use error::SyncError;
pub use fanout::{sync_endpoints, sync_local_to_leader};
pub use pack::make_tar;
