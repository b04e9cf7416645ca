//! On-disk artifact storage for depkeep.
//!
//! This crate provides the storage layer shared by the mirror and the bundler:
//! an `ArtifactStore` keyed by (name, version, platform) with atomic writes,
//! `StoreLayout` for directory structure management, deterministic tar
//! archives for bundles, an integrity scan against pinned digests, and
//! `RetentionPruner` for dropping versions the manifest no longer needs.

pub mod archive;
pub mod artifacts;
pub mod integrity;
pub mod layout;
pub mod retention;

pub use archive::{pack_archive, unpack_archive, ArchiveMember};
pub use artifacts::{ArtifactKey, ArtifactStore};
pub use integrity::{verify_artifacts, IntegrityFailure, IntegrityReport};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use retention::{PruneReport, RetentionPruner};

use std::path::Path;
use thiserror::Error;

/// Replace `dest` with `data` atomically, see [`depkeep_schema::write_atomic`].
pub fn write_atomic(dest: &Path, data: &[u8]) -> Result<(), StoreError> {
    depkeep_schema::write_atomic(dest, data)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for artifact '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("invalid artifact key component: '{0}'")]
    InvalidKey(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("malformed archive: {0}")]
    Archive(String),
}
