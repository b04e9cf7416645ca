//! Offline wheelhouse bundles.
//!
//! A bundle is a deterministic tar holding every pinned artifact under
//! `artifacts/<name>/<version>/<platform>` plus an `index.json`
//! [`BundleManifest`]. Every artifact is checked against its pinned digest
//! before anything is written; a mismatch aborts the whole bundle.

use crate::concurrency::{worker_pool, StoreLock};
use crate::preflight::PreflightResult;
use crate::{store_read_error, CoreError};
use depkeep_registry::RegistryClient;
use depkeep_schema::{Digest, Manifest, PackageName, Platform, Version};
use depkeep_store::{pack_archive, unpack_archive, ArchiveMember, ArtifactKey, ArtifactStore, StoreError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const BUNDLE_FORMAT_VERSION: u32 = 1;
const INDEX_MEMBER: &str = "index.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub name: PackageName,
    #[serde(with = "depkeep_schema::version::lenient")]
    pub version: Version,
    pub platform: Platform,
    pub digest: Digest,
    /// Member path inside the archive.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// The bundle index. Contains nothing time-dependent, so an unchanged
/// manifest always yields the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub format_version: u32,
    pub project: String,
    pub manifest_fingerprint: String,
    /// Sorted by (name, platform).
    pub entries: Vec<BundleEntry>,
    /// blake3 over one `name\tversion\tplatform\tdigest\tpath` line per entry.
    pub checksum: String,
}

impl BundleManifest {
    fn compute_checksum(entries: &[BundleEntry]) -> String {
        let mut lines = String::new();
        for e in entries {
            let _ = writeln!(lines, "{}\t{}\t{}\t{}\t{}", e.name, e.version, e.platform, e.digest, e.path);
        }
        blake3::hash(lines.as_bytes()).to_hex().to_string()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BundlerConfig {
    pub workers: usize,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self { workers: 8 }
    }
}

/// Path of the index written next to a bundle.
pub fn sibling_index_path(out: &Path) -> PathBuf {
    let mut s = out.as_os_str().to_owned();
    s.push(".index.json");
    PathBuf::from(s)
}

pub struct Bundler<'a> {
    registry: &'a dyn RegistryClient,
    cache: &'a ArtifactStore,
    config: BundlerConfig,
}

impl<'a> Bundler<'a> {
    pub fn new(registry: &'a dyn RegistryClient, cache: &'a ArtifactStore, config: BundlerConfig) -> Self {
        Self {
            registry,
            cache,
            config,
        }
    }

    /// Build a bundle for `manifest` at `out`.
    ///
    /// Nothing is written to `out` unless every artifact verified.
    pub fn bundle(
        &self,
        manifest: &Manifest,
        preflight: &PreflightResult,
        out: &Path,
    ) -> Result<BundleManifest, CoreError> {
        if !preflight.passed {
            return Err(CoreError::PreflightNotPassed(preflight.violations.len()));
        }

        let layout = self.cache.layout();
        layout.initialize()?;
        let _lock = StoreLock::acquire(&layout.lock_file())?;

        let mut entries: Vec<BundleEntry> = manifest
            .entries
            .iter()
            .flat_map(|entry| {
                entry.hashes.iter().map(move |(platform, digest)| {
                    let key = ArtifactKey::new(entry.name.clone(), entry.version.clone(), platform.clone());
                    BundleEntry {
                        path: format!("artifacts/{}", key.relative_path()),
                        name: key.name,
                        version: key.version,
                        platform: key.platform,
                        digest: digest.clone(),
                        signature: entry.signature.clone(),
                    }
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.platform.cmp(&b.platform)));

        let pool = worker_pool(self.config.workers)?;
        let blobs: Vec<Vec<u8>> = pool.install(|| {
            entries
                .par_iter()
                .map(|e| self.materialize(e))
                .collect::<Result<Vec<_>, CoreError>>()
        })?;

        let index = BundleManifest {
            format_version: BUNDLE_FORMAT_VERSION,
            project: manifest.project.clone(),
            manifest_fingerprint: manifest.fingerprint()?,
            checksum: BundleManifest::compute_checksum(&entries),
            entries,
        };
        let index_json = index.to_json()?;

        let mut members: Vec<ArchiveMember> = index
            .entries
            .iter()
            .zip(blobs)
            .map(|(e, data)| ArchiveMember::new(e.path.clone(), data))
            .collect();
        members.push(ArchiveMember::new(INDEX_MEMBER, index_json.clone()));
        let archive = pack_archive(&members)?;

        if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        depkeep_store::write_atomic(out, &archive)?;
        depkeep_store::write_atomic(&sibling_index_path(out), &index_json)?;

        tracing::info!(
            "bundled {} artifact(s) for '{}' into {}",
            index.entries.len(),
            index.project,
            out.display()
        );
        Ok(index)
    }

    /// Bytes for one bundle entry, from the cache when present.
    ///
    /// A cached object that fails verification is an error; it is never
    /// replaced by a fresh download.
    fn materialize(&self, entry: &BundleEntry) -> Result<Vec<u8>, CoreError> {
        let key = ArtifactKey::new(entry.name.clone(), entry.version.clone(), entry.platform.clone());
        if self.cache.exists(&key) {
            tracing::debug!("using cached {key}");
            return self.cache.get_verified(&key, &entry.digest).map_err(store_read_error);
        }

        let data = self
            .registry
            .fetch_artifact(&entry.name, &entry.version, &entry.platform)?;
        if !entry.digest.matches(&data) {
            return Err(CoreError::Integrity {
                artifact: key.to_string(),
                expected: entry.digest.to_string(),
                actual: Digest::compute(entry.digest.algorithm(), &data).to_string(),
            });
        }
        self.cache.put(&key, &data)?;
        Ok(data)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BundleVerification {
    pub entries_checked: usize,
    pub checksum_ok: bool,
    pub failures: Vec<String>,
}

impl BundleVerification {
    pub fn is_valid(&self) -> bool {
        self.checksum_ok && self.failures.is_empty()
    }
}

/// Re-hash every member of an existing bundle against its index.
pub fn verify_bundle(path: &Path) -> Result<BundleVerification, CoreError> {
    let data = std::fs::read(path)?;
    let members = unpack_archive(&data)?;
    let index_member = members
        .iter()
        .find(|m| m.path == INDEX_MEMBER)
        .ok_or_else(|| StoreError::Archive(format!("{} has no {INDEX_MEMBER}", path.display())))?;
    let index: BundleManifest = serde_json::from_slice(&index_member.data)?;

    let mut report = BundleVerification {
        checksum_ok: BundleManifest::compute_checksum(&index.entries) == index.checksum,
        ..BundleVerification::default()
    };
    for entry in &index.entries {
        report.entries_checked += 1;
        match members.iter().find(|m| m.path == entry.path) {
            None => report.failures.push(format!("{}: missing from archive", entry.path)),
            Some(m) if !entry.digest.matches(&m.data) => {
                report.failures.push(format!("{}: digest mismatch", entry.path));
            }
            Some(_) => {}
        }
    }
    if !report.is_valid() {
        tracing::warn!("bundle {} failed verification", path.display());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::{Violation, ViolationCode};
    use depkeep_registry::IndexRegistry;
    use depkeep_schema::{HashAlgorithm, PinnedEntry};
    use depkeep_store::StoreLayout;
    use std::collections::BTreeMap;

    fn passed() -> PreflightResult {
        PreflightResult {
            passed: true,
            violations: Vec::new(),
            hashes_complete: true,
            signatures_present: true,
        }
    }

    fn v(s: &str) -> Version {
        depkeep_schema::parse_version(s).unwrap()
    }

    fn fixture() -> (tempfile::TempDir, IndexRegistry, ArtifactStore, Manifest) {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = IndexRegistry::new("idx");
        let mut manifest = Manifest::new("app", vec![]);
        for (name, version, platforms) in [
            ("libA", "1.2.9", vec!["linux-x86_64", "macos-arm64"]),
            ("libB", "2.0.0", vec!["any"]),
        ] {
            let mut hashes = BTreeMap::new();
            for p in platforms {
                let digest = registry.add_artifact(name, &v(version), p, format!("{name}-{p}").into_bytes());
                hashes.insert(Platform::new(p), digest);
            }
            manifest.entries.push(PinnedEntry {
                name: name.into(),
                version: v(version),
                provenance: "idx".to_owned(),
                signature: Some(format!("sig:{name}")),
                hashes,
                dependencies: BTreeMap::new(),
            });
        }
        let store = ArtifactStore::new(StoreLayout::new(dir.path().join("cache")));
        (dir, registry, store, manifest)
    }

    #[test]
    fn bundles_and_verifies() {
        let (dir, registry, store, manifest) = fixture();
        let out = dir.path().join("out/app.tar");
        let bundler = Bundler::new(&registry, &store, BundlerConfig::default());

        let index = bundler.bundle(&manifest, &passed(), &out).unwrap();
        assert_eq!(index.entries.len(), 3);
        assert_eq!(index.entries[0].path, "artifacts/libA/1.2.9/linux-x86_64");
        assert_eq!(index.entries[2].signature.as_deref(), Some("sig:libB"));
        assert!(sibling_index_path(&out).exists());

        let report = verify_bundle(&out).unwrap();
        assert!(report.is_valid());
        assert_eq!(report.entries_checked, 3);

        // Fetched artifacts are cached for the next run.
        assert_eq!(store.list().unwrap().len(), 3);
    }

    #[test]
    fn index_is_identical_across_runs() {
        let (dir, registry, store, manifest) = fixture();
        let bundler = Bundler::new(&registry, &store, BundlerConfig::default());
        let first = dir.path().join("first.tar");
        let second = dir.path().join("second.tar");
        bundler.bundle(&manifest, &passed(), &first).unwrap();
        bundler.bundle(&manifest, &passed(), &second).unwrap();

        assert_eq!(
            std::fs::read(sibling_index_path(&first)).unwrap(),
            std::fs::read(sibling_index_path(&second)).unwrap()
        );
        assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
    }

    #[test]
    fn corrupted_cache_aborts_without_output() {
        let (dir, registry, store, manifest) = fixture();
        store.layout().initialize().unwrap();
        let key = ArtifactKey::new("libB", v("2.0.0"), "any");
        let mut bytes = b"libB-any".to_vec();
        bytes[0] ^= 0x01;
        store.put(&key, &bytes).unwrap();

        let out = dir.path().join("app.tar");
        let bundler = Bundler::new(&registry, &store, BundlerConfig::default());
        let err = bundler.bundle(&manifest, &passed(), &out).unwrap_err();
        assert!(err.is_integrity(), "{err}");
        assert!(!out.exists());
        assert!(!sibling_index_path(&out).exists());
        // The bad object is left for the operator; it is not silently replaced.
        assert_eq!(store.get(&key).unwrap(), bytes);
    }

    #[test]
    fn registry_bytes_must_match_pin() {
        let (dir, registry, store, mut manifest) = fixture();
        manifest.entries[1]
            .hashes
            .insert(Platform::new("any"), Digest::compute(HashAlgorithm::Sha256, b"something else"));

        let out = dir.path().join("app.tar");
        let bundler = Bundler::new(&registry, &store, BundlerConfig::default());
        let err = bundler.bundle(&manifest, &passed(), &out).unwrap_err();
        assert!(matches!(err, CoreError::Integrity { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn refuses_failed_preflight() {
        let (dir, registry, store, manifest) = fixture();
        let failed = PreflightResult {
            passed: false,
            violations: vec![Violation {
                code: ViolationCode::MissingHash,
                dependency: Some("libA".to_owned()),
                message: "missing".to_owned(),
            }],
            hashes_complete: false,
            signatures_present: true,
        };
        let bundler = Bundler::new(&registry, &store, BundlerConfig::default());
        let err = bundler
            .bundle(&manifest, &failed, &dir.path().join("app.tar"))
            .unwrap_err();
        assert!(matches!(err, CoreError::PreflightNotPassed(1)));
    }

    #[test]
    fn verify_detects_tampered_member() {
        let (dir, registry, store, manifest) = fixture();
        let out = dir.path().join("app.tar");
        Bundler::new(&registry, &store, BundlerConfig::default())
            .bundle(&manifest, &passed(), &out)
            .unwrap();

        let mut members = unpack_archive(&std::fs::read(&out).unwrap()).unwrap();
        let target = members.iter_mut().find(|m| m.path.ends_with("libB/2.0.0/any")).unwrap();
        target.data[0] ^= 0x01;
        std::fs::write(&out, pack_archive(&members).unwrap()).unwrap();

        let report = verify_bundle(&out).unwrap();
        assert!(!report.is_valid());
        assert!(report.checksum_ok);
        assert_eq!(report.failures.len(), 1);
    }
}
