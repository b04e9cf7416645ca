//! Manifest model, version constraints, and content digests for depkeep.
//!
//! This crate defines the schema layer: the hash-pinned `Manifest` (declared
//! `Requirement`s plus resolved `PinnedEntry`s), constraint parsing over
//! semantic versions (`Constraint`), algorithm-tagged content hashes
//! (`Digest`), and atomic on-disk persistence of the committed manifest
//! (`ManifestFile`).

pub mod digest;
pub mod manifest;
pub mod types;
pub mod version;

pub use digest::{Digest, HashAlgorithm};
pub use manifest::{
    write_atomic, Manifest, ManifestError, ManifestFile, PinnedEntry, Requirement,
    ANY_PLATFORM, MANIFEST_VERSION,
};
pub use types::{PackageName, Platform};
pub use version::{parse_version, Constraint};
pub use semver::Version;
