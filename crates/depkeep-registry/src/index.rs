use crate::{RegistryClient, RegistryError, VersionInfo};
use depkeep_schema::{Digest, HashAlgorithm, PackageName, Platform, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "index.json";
const ARTIFACTS_DIR: &str = "artifacts";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexedVersion {
    #[serde(flatten)]
    info: VersionInfo,
    #[serde(default)]
    hashes: BTreeMap<Platform, Digest>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    name: String,
    #[serde(default)]
    packages: BTreeMap<PackageName, Vec<IndexedVersion>>,
}

type BlobKey = (PackageName, Version, Platform);

/// A registry served from memory or from a snapshot directory.
///
/// Snapshot layout:
///
/// ```text
/// <root>/index.json
/// <root>/artifacts/<name>/<version>/<platform>
/// ```
///
/// Used for air-gapped runs against an exported index and as the registry
/// in tests.
#[derive(Debug, Clone, Default)]
pub struct IndexRegistry {
    name: String,
    packages: BTreeMap<PackageName, BTreeMap<Version, IndexedVersion>>,
    blobs: BTreeMap<BlobKey, Vec<u8>>,
    root: Option<PathBuf>,
}

fn check_segment(s: &str) -> Result<(), RegistryError> {
    if s.is_empty() || s.starts_with('.') || s.contains('/') || s.contains('\\') {
        return Err(RegistryError::Protocol(format!("invalid path segment '{s}'")));
    }
    Ok(())
}

impl IndexRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    /// Add or replace version metadata. Recorded hashes are kept.
    pub fn publish(&mut self, name: &str, info: VersionInfo) -> &mut Self {
        let versions = self.packages.entry(PackageName::new(name)).or_default();
        match versions.get_mut(&info.version) {
            Some(existing) => existing.info = info,
            None => {
                versions.insert(
                    info.version.clone(),
                    IndexedVersion {
                        info,
                        hashes: BTreeMap::new(),
                    },
                );
            }
        }
        self
    }

    /// Store artifact bytes and record their sha256 digest. Publishes the
    /// version with empty metadata when it is not known yet.
    pub fn add_artifact(
        &mut self,
        name: &str,
        version: &Version,
        platform: &str,
        data: Vec<u8>,
    ) -> Digest {
        let digest = Digest::compute(HashAlgorithm::Sha256, &data);
        self.set_hash(name, version, platform, digest.clone());
        self.blobs.insert(
            (PackageName::new(name), version.clone(), Platform::new(platform)),
            data,
        );
        digest
    }

    /// Record a digest without holding the artifact bytes.
    pub fn set_hash(&mut self, name: &str, version: &Version, platform: &str, digest: Digest) {
        let versions = self.packages.entry(PackageName::new(name)).or_default();
        versions
            .entry(version.clone())
            .or_insert_with(|| IndexedVersion {
                info: VersionInfo::new(version.clone()),
                hashes: BTreeMap::new(),
            })
            .hashes
            .insert(Platform::new(platform), digest);
    }

    pub fn load_dir(root: &Path) -> Result<Self, RegistryError> {
        let content = fs::read(root.join(INDEX_FILE))?;
        let file: IndexFile = serde_json::from_slice(&content)
            .map_err(|e| RegistryError::Protocol(format!("invalid index snapshot: {e}")))?;
        let mut registry = Self::new(&file.name);
        for (name, versions) in file.packages {
            let entry = registry.packages.entry(name).or_default();
            for v in versions {
                entry.insert(v.info.version.clone(), v);
            }
        }
        registry.root = Some(root.to_path_buf());
        tracing::debug!(
            "loaded index snapshot '{}' with {} package(s)",
            registry.name,
            registry.packages.len()
        );
        Ok(registry)
    }

    /// Write an index snapshot including every in-memory artifact.
    pub fn save_dir(&self, root: &Path) -> Result<(), RegistryError> {
        fs::create_dir_all(root)?;
        let file = IndexFile {
            name: self.name.clone(),
            packages: self
                .packages
                .iter()
                .map(|(name, versions)| (name.clone(), versions.values().cloned().collect()))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| RegistryError::Protocol(e.to_string()))?;
        fs::write(root.join(INDEX_FILE), json)?;
        for ((name, version, platform), data) in &self.blobs {
            let path = Self::blob_path(root, name, version, platform)?;
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(path, data)?;
        }
        Ok(())
    }

    fn blob_path(
        root: &Path,
        name: &str,
        version: &Version,
        platform: &str,
    ) -> Result<PathBuf, RegistryError> {
        check_segment(name)?;
        check_segment(platform)?;
        Ok(root
            .join(ARTIFACTS_DIR)
            .join(name)
            .join(version.to_string())
            .join(platform))
    }

    fn indexed(&self, name: &str, version: &Version) -> Result<&IndexedVersion, RegistryError> {
        let versions = self
            .packages
            .get(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RegistryError::PackageNotFound(name.to_owned()))?;
        versions
            .get(version)
            .ok_or_else(|| RegistryError::VersionNotFound {
                name: name.to_owned(),
                version: version.to_string(),
            })
    }
}

impl RegistryClient for IndexRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_versions(&self, name: &str) -> Result<Vec<VersionInfo>, RegistryError> {
        let versions = self
            .packages
            .get(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RegistryError::PackageNotFound(name.to_owned()))?;
        Ok(versions.values().map(|v| v.info.clone()).collect())
    }

    fn fetch_artifact_hash(
        &self,
        name: &str,
        version: &Version,
        platform: &str,
    ) -> Result<Digest, RegistryError> {
        self.indexed(name, version)?
            .hashes
            .get(platform)
            .cloned()
            .ok_or_else(|| RegistryError::ArtifactNotFound {
                name: name.to_owned(),
                version: version.to_string(),
                platform: platform.to_owned(),
            })
    }

    fn fetch_artifact(
        &self,
        name: &str,
        version: &Version,
        platform: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let not_found = || RegistryError::ArtifactNotFound {
            name: name.to_owned(),
            version: version.to_string(),
            platform: platform.to_owned(),
        };
        let key = (
            PackageName::new(name),
            version.clone(),
            Platform::new(platform),
        );
        if let Some(data) = self.blobs.get(&key) {
            return Ok(data.clone());
        }
        let Some(root) = &self.root else {
            return Err(not_found());
        };
        let path = Self::blob_path(root, name, version, platform)?;
        if !path.is_file() {
            return Err(not_found());
        }
        Ok(fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depkeep_schema::Constraint;

    fn sample() -> IndexRegistry {
        let mut registry = IndexRegistry::new("test-index");
        registry
            .publish("libA", VersionInfo::new(Version::new(1, 4, 0)))
            .publish("libA", VersionInfo::new(Version::new(1, 2, 0)))
            .publish(
                "libB",
                VersionInfo::new(Version::new(2, 0, 0))
                    .depends_on("libA", Constraint::parse("<1.3").unwrap()),
            );
        registry.add_artifact("libA", &Version::new(1, 2, 0), "any", b"libA-1.2.0".to_vec());
        registry
    }

    #[test]
    fn versions_are_ascending() {
        let registry = sample();
        let versions: Vec<Version> = registry
            .fetch_versions("libA")
            .unwrap()
            .into_iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(versions, vec![Version::new(1, 2, 0), Version::new(1, 4, 0)]);
    }

    #[test]
    fn unknown_package_and_version() {
        let registry = sample();
        assert!(matches!(
            registry.fetch_versions("ghost"),
            Err(RegistryError::PackageNotFound(_))
        ));
        assert!(matches!(
            registry.fetch_artifact_hash("libA", &Version::new(9, 0, 0), "any"),
            Err(RegistryError::VersionNotFound { .. })
        ));
    }

    #[test]
    fn artifact_hash_matches_bytes() {
        let registry = sample();
        let v = Version::new(1, 2, 0);
        let digest = registry.fetch_artifact_hash("libA", &v, "any").unwrap();
        let bytes = registry.fetch_artifact("libA", &v, "any").unwrap();
        assert!(digest.matches(&bytes));
        assert!(matches!(
            registry.fetch_artifact("libA", &v, "linux-x86_64"),
            Err(RegistryError::ArtifactNotFound { .. })
        ));
    }

    #[test]
    fn publish_keeps_recorded_hashes() {
        let mut registry = sample();
        let v = Version::new(1, 2, 0);
        registry.publish("libA", VersionInfo::new(v.clone()).yanked());
        assert!(registry.fetch_artifact_hash("libA", &v, "any").is_ok());
        assert!(registry.fetch_version("libA", &v).unwrap().yanked);
    }

    #[test]
    fn snapshot_dir_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let original = sample();
        original.save_dir(dir.path()).unwrap();

        let loaded = IndexRegistry::load_dir(dir.path()).unwrap();
        assert_eq!(loaded.name(), "test-index");
        assert_eq!(
            loaded.fetch_versions("libB").unwrap(),
            original.fetch_versions("libB").unwrap()
        );
        let v = Version::new(1, 2, 0);
        assert_eq!(loaded.fetch_artifact("libA", &v, "any").unwrap(), b"libA-1.2.0");
        assert_eq!(
            loaded.fetch_artifact_hash("libA", &v, "any").unwrap(),
            original.fetch_artifact_hash("libA", &v, "any").unwrap()
        );
    }

    #[test]
    fn invalid_snapshot_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.json"), b"[1, 2").unwrap();
        assert!(matches!(
            IndexRegistry::load_dir(dir.path()),
            Err(RegistryError::Protocol(_))
        ));
    }
}
