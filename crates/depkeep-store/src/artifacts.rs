use crate::layout::StoreLayout;
use crate::StoreError;
use depkeep_schema::{Digest, PackageName, Platform, Version};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::PathBuf;

/// Identity of one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ArtifactKey {
    pub name: PackageName,
    pub version: Version,
    pub platform: Platform,
}

impl ArtifactKey {
    pub fn new(name: impl Into<PackageName>, version: Version, platform: impl Into<Platform>) -> Self {
        Self {
            name: name.into(),
            version,
            platform: platform.into(),
        }
    }

    /// Relative path of this artifact under an artifacts root.
    pub fn relative_path(&self) -> String {
        format!("{}/{}/{}", self.name, self.version, self.platform)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.version, self.platform)
    }
}

fn check_component(s: &str) -> Result<(), StoreError> {
    if s.is_empty()
        || s.starts_with('.')
        || s.contains('/')
        || s.contains('\\')
        || s.contains('\0')
    {
        return Err(StoreError::InvalidKey(s.to_owned()));
    }
    Ok(())
}

/// Artifact bytes keyed by (name, version, platform).
///
/// Writes are atomic. Reads through [`get_verified`](Self::get_verified)
/// recompute the digest and refuse mismatching bytes; the store never
/// repairs a mismatching object on its own.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    layout: StoreLayout,
}

impl ArtifactStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn path_of(&self, key: &ArtifactKey) -> Result<PathBuf, StoreError> {
        check_component(&key.name)?;
        check_component(&key.platform)?;
        Ok(self
            .layout
            .artifacts_dir()
            .join(key.name.as_str())
            .join(key.version.to_string())
            .join(key.platform.as_str()))
    }

    /// Store artifact bytes, replacing any previous object under the same key.
    pub fn put(&self, key: &ArtifactKey, data: &[u8]) -> Result<(), StoreError> {
        let dest = self.path_of(key)?;
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir)?;
        }
        crate::write_atomic(&dest, data)?;
        tracing::debug!("stored {key} ({} bytes)", data.len());
        Ok(())
    }

    pub fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
        let path = self.path_of(key)?;
        if !path.is_file() {
            return Err(StoreError::ArtifactNotFound(key.relative_path()));
        }
        Ok(fs::read(path)?)
    }

    /// Read an artifact and check it against the pinned digest.
    pub fn get_verified(&self, key: &ArtifactKey, expected: &Digest) -> Result<Vec<u8>, StoreError> {
        let data = self.get(key)?;
        let actual = Digest::compute(expected.algorithm(), &data);
        if actual != *expected {
            return Err(StoreError::IntegrityFailure {
                key: key.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    pub fn exists(&self, key: &ArtifactKey) -> bool {
        self.path_of(key).is_ok_and(|p| p.is_file())
    }

    /// Remove an artifact and any directories it leaves empty.
    pub fn remove(&self, key: &ArtifactKey) -> Result<(), StoreError> {
        let path = self.path_of(key)?;
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let root = self.layout.artifacts_dir();
        let mut dir = path.parent().map(PathBuf::from);
        while let Some(d) = dir {
            if d == root || !d.starts_with(&root) {
                break;
            }
            let empty = fs::read_dir(&d).map(|mut it| it.next().is_none()).unwrap_or(false);
            if !empty {
                break;
            }
            fs::remove_dir(&d)?;
            dir = d.parent().map(PathBuf::from);
        }
        Ok(())
    }

    /// Every stored artifact, sorted by key.
    pub fn list(&self) -> Result<Vec<ArtifactKey>, StoreError> {
        let mut keys = Vec::new();
        for name in sorted_children(&self.layout.artifacts_dir())? {
            let name_dir = self.layout.artifacts_dir().join(&name);
            for version_str in sorted_children(&name_dir)? {
                let Ok(version) = Version::parse(&version_str) else {
                    tracing::warn!("skipping unparsable version directory {name}/{version_str}");
                    continue;
                };
                for platform in sorted_children(&name_dir.join(&version_str))? {
                    keys.push(ArtifactKey::new(name.as_str(), version.clone(), platform));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Versions stored for `name`, ascending.
    pub fn versions_of(&self, name: &str) -> Result<Vec<Version>, StoreError> {
        check_component(name)?;
        let mut versions: Vec<Version> = sorted_children(&self.layout.artifacts_dir().join(name))?
            .iter()
            .filter_map(|v| Version::parse(v).ok())
            .collect();
        versions.sort();
        Ok(versions)
    }
}

fn sorted_children(dir: &std::path::Path) -> Result<Vec<String>, StoreError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}
