use crate::digest::Digest;
use crate::types::{PackageName, Platform};
use crate::version::{lenient, Constraint};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MANIFEST_VERSION: u32 = 1;

/// Platform tag for artifacts that install on every platform.
pub const ANY_PLATFORM: &str = "any";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unsupported manifest_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("duplicate entry for dependency '{0}'")]
    DuplicateEntry(String),
    #[error("duplicate requirement for dependency '{0}'")]
    DuplicateRequirement(String),
    #[error("invalid version '{input}': {reason}")]
    InvalidVersion { input: String, reason: String },
    #[error("invalid version constraint '{input}': {reason}")]
    InvalidConstraint { input: String, reason: String },
    #[error("invalid digest '{input}': {reason}")]
    InvalidDigest { input: String, reason: String },
}

/// A dependency declared by the project.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Requirement {
    pub name: PackageName,
    pub constraint: Constraint,
    /// Artifacts of this dependency must carry a signature reference.
    #[serde(default, skip_serializing_if = "is_false")]
    pub signed: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub extras: BTreeSet<String>,
}

/// A dependency resolved to an exact version with per-platform content hashes.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PinnedEntry {
    pub name: PackageName,
    #[serde(with = "lenient")]
    pub version: Version,
    /// Registry or mirror the pin was resolved against.
    pub provenance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default)]
    pub hashes: BTreeMap<Platform, Digest>,
    /// Constraints this pinned version places on other dependencies.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<PackageName, Constraint>,
}

impl PinnedEntry {
    /// Digest covering `platform`, falling back to the platform-neutral artifact.
    pub fn hash_for(&self, platform: &str) -> Option<&Digest> {
        self.hashes
            .get(platform)
            .or_else(|| self.hashes.get(ANY_PLATFORM))
    }
}

/// The authoritative set of pinned dependencies for a project.
///
/// Entry names are unique. Entry order carries no meaning for correctness but
/// is preserved across reads and writes so diffs stay stable.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub manifest_version: u32,
    pub project: String,
    /// Platforms every entry must carry a hash for.
    #[serde(default)]
    pub platforms: Vec<Platform>,
    #[serde(rename = "requirement", default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,
    #[serde(rename = "entry", default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<PinnedEntry>,
}

impl Manifest {
    pub fn new(project: impl Into<String>, platforms: Vec<Platform>) -> Self {
        Self {
            manifest_version: MANIFEST_VERSION,
            project: project.into(),
            platforms,
            requirements: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, name: &str) -> Option<&PinnedEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn requirement(&self, name: &str) -> Option<&Requirement> {
        self.requirements.iter().find(|r| r.name == name)
    }

    /// Insert or replace an entry, keeping its position when it already exists.
    /// Returns the previous entry.
    pub fn set_entry(&mut self, entry: PinnedEntry) -> Option<PinnedEntry> {
        match self.entries.iter_mut().find(|e| e.name == entry.name) {
            Some(slot) => Some(std::mem::replace(slot, entry)),
            None => {
                self.entries.push(entry);
                None
            }
        }
    }

    /// Platforms an entry must be hashed for. An empty platform list means
    /// only the platform-neutral artifact is required.
    pub fn required_platforms(&self) -> Vec<Platform> {
        if self.platforms.is_empty() {
            vec![Platform::new(ANY_PLATFORM)]
        } else {
            self.platforms.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.manifest_version != MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion(self.manifest_version));
        }
        let mut seen = HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.name.as_str()) {
                return Err(ManifestError::DuplicateEntry(entry.name.to_string()));
            }
        }
        let mut seen = HashSet::new();
        for req in &self.requirements {
            if !seen.insert(req.name.as_str()) {
                return Err(ManifestError::DuplicateRequirement(req.name.to_string()));
            }
        }
        Ok(())
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = toml::from_str(input)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_toml_string(&self) -> Result<String, ManifestError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// blake3 over the canonical serialized form.
    pub fn fingerprint(&self) -> Result<String, ManifestError> {
        let content = self.to_toml_string()?;
        Ok(blake3::hash(content.as_bytes()).to_hex().to_string())
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), ManifestError> {
        let content = self.to_toml_string()?;
        write_atomic(path.as_ref(), content.as_bytes())?;
        Ok(())
    }
}

/// Replace `dest` with `data` atomically.
///
/// The bytes land in a temp file in the destination directory, are synced,
/// then renamed over `dest`, and the directory is synced so the rename
/// survives power loss. Readers see either the old file or the new one.
pub fn write_atomic(dest: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    fs::File::open(dir)?.sync_all()
}

/// Location of the committed manifest on disk and its companion lock file.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    path: PathBuf,
}

impl ManifestFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock file guarding single-writer access to the manifest.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    pub fn load(&self) -> Result<Manifest, ManifestError> {
        Manifest::read_from_file(&self.path)
    }

    pub fn commit(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        manifest.validate()?;
        manifest.write_to_file(&self.path)?;
        tracing::debug!("committed manifest to {}", self.path.display());
        Ok(())
    }

    /// blake3 of the raw bytes currently on disk.
    pub fn file_hash(&self) -> Result<String, ManifestError> {
        let data = fs::read(&self.path)?;
        Ok(blake3::hash(&data).to_hex().to_string())
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}
