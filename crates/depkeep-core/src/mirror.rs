use crate::concurrency::{worker_pool, CancelToken, StoreLock};
use crate::CoreError;
use depkeep_registry::RegistryClient;
use depkeep_schema::{Digest, Manifest, PackageName, Version};
use depkeep_store::{verify_artifacts, ArtifactKey, ArtifactStore, IntegrityReport, RetentionPruner};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MirrorConfig {
    /// Older versions kept per name in addition to the pinned one.
    pub retention: usize,
    pub workers: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            retention: 2,
            workers: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub key: ArtifactKey,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub fetched: Vec<ArtifactKey>,
    /// Artifacts already in the mirror and left alone.
    pub present: usize,
    pub failed: Vec<SyncFailure>,
    pub pruned: Vec<ArtifactKey>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Keeps a local artifact mirror in step with a manifest.
///
/// Sync only fetches what is missing, so an interrupted run is resumed by
/// running it again.
pub struct MirrorManager<'a> {
    registry: &'a dyn RegistryClient,
    store: &'a ArtifactStore,
    config: MirrorConfig,
    cancel: CancelToken,
}

impl<'a> MirrorManager<'a> {
    pub fn new(registry: &'a dyn RegistryClient, store: &'a ArtifactStore, config: MirrorConfig) -> Self {
        Self {
            registry,
            store,
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Stop pruning once `cancel` fires. Fetched artifacts are kept.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn sync(&self, manifest: &Manifest) -> Result<SyncReport, CoreError> {
        let layout = self.store.layout();
        layout.initialize()?;
        let _lock = StoreLock::acquire(&layout.lock_file())?;

        let wanted = wanted_artifacts(manifest);
        let missing: Vec<&(ArtifactKey, Digest)> = wanted.iter().filter(|(key, _)| !self.store.exists(key)).collect();
        let mut report = SyncReport {
            present: wanted.len() - missing.len(),
            ..SyncReport::default()
        };
        tracing::info!(
            "mirror sync: {} wanted, {} present, {} to fetch",
            wanted.len(),
            report.present,
            missing.len()
        );

        let pool = worker_pool(self.config.workers)?;
        let results: Vec<(ArtifactKey, Result<(), CoreError>)> = pool.install(|| {
            missing
                .par_iter()
                .map(|(key, digest)| (key.clone(), self.fetch_one(key, digest)))
                .collect()
        });

        // Everything that verified is already stored; an integrity failure
        // still ends the sync as an error.
        let mut fatal = None;
        for (key, result) in results {
            match result {
                Ok(()) => report.fetched.push(key),
                Err(e) if e.is_integrity() => {
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
                Err(CoreError::Registry(e)) => {
                    tracing::warn!("failed to fetch {key}: {e}");
                    report.failed.push(SyncFailure {
                        key,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let pins: BTreeMap<PackageName, Version> = manifest
            .entries
            .iter()
            .map(|e| (e.name.clone(), e.version.clone()))
            .collect();
        let pruned = RetentionPruner::new(self.store.clone()).prune_with_cancel(
            &pins,
            self.config.retention,
            false,
            || self.cancel.is_cancelled(),
        )?;
        if pruned.removed < pruned.candidates.len() {
            tracing::warn!(
                "mirror prune cancelled: {} of {} removed",
                pruned.removed,
                pruned.candidates.len()
            );
        }
        report.pruned = pruned.candidates.into_iter().take(pruned.removed).collect();

        tracing::info!(
            "mirror sync done: {} fetched, {} failed, {} pruned",
            report.fetched.len(),
            report.failed.len(),
            report.pruned.len()
        );
        Ok(report)
    }

    fn fetch_one(&self, key: &ArtifactKey, digest: &Digest) -> Result<(), CoreError> {
        let data = self.registry.fetch_artifact(&key.name, &key.version, &key.platform)?;
        if !digest.matches(&data) {
            return Err(CoreError::Integrity {
                artifact: key.to_string(),
                expected: digest.to_string(),
                actual: Digest::compute(digest.algorithm(), &data).to_string(),
            });
        }
        self.store.put(key, &data)?;
        tracing::debug!("mirrored {key}");
        Ok(())
    }
}

/// Check every mirrored artifact of `manifest` against its pinned digest.
///
/// Reads only the mirror; no registry is involved.
pub fn verify_mirror(store: &ArtifactStore, manifest: &Manifest) -> Result<IntegrityReport, CoreError> {
    let report = verify_artifacts(store, &wanted_artifacts(manifest))?;
    if !report.is_clean() {
        tracing::warn!("{} mirrored artifact(s) failed verification", report.failed.len());
    }
    Ok(report)
}

/// Every (artifact, pinned digest) pair the manifest references.
fn wanted_artifacts(manifest: &Manifest) -> Vec<(ArtifactKey, Digest)> {
    manifest
        .entries
        .iter()
        .flat_map(|entry| {
            entry.hashes.iter().map(move |(platform, digest)| {
                (
                    ArtifactKey::new(entry.name.clone(), entry.version.clone(), platform.clone()),
                    digest.clone(),
                )
            })
        })
        .collect()
}
