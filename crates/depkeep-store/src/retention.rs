use crate::artifacts::{ArtifactKey, ArtifactStore};
use crate::StoreError;
use depkeep_schema::{PackageName, Version};
use std::collections::{BTreeMap, BTreeSet};

/// Drops artifacts the manifest no longer references.
///
/// For every stored name, the pinned version is kept along with up to
/// `keep_previous` older versions. Versions newer than the pin and names the
/// manifest does not mention are removed entirely.
pub struct RetentionPruner {
    store: ArtifactStore,
}

#[derive(Debug, Default)]
pub struct PruneReport {
    pub candidates: Vec<ArtifactKey>,
    pub removed: usize,
}

impl RetentionPruner {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    pub fn prune(
        &self,
        pins: &BTreeMap<PackageName, Version>,
        keep_previous: usize,
        dry_run: bool,
    ) -> Result<PruneReport, StoreError> {
        self.prune_with_cancel(pins, keep_previous, dry_run, || false)
    }

    pub fn prune_with_cancel(
        &self,
        pins: &BTreeMap<PackageName, Version>,
        keep_previous: usize,
        dry_run: bool,
        should_stop: impl Fn() -> bool,
    ) -> Result<PruneReport, StoreError> {
        let all = self.store.list()?;

        let mut by_name: BTreeMap<&str, BTreeSet<&Version>> = BTreeMap::new();
        for key in &all {
            by_name.entry(key.name.as_str()).or_default().insert(&key.version);
        }

        let mut live: BTreeSet<(&str, &Version)> = BTreeSet::new();
        for (name, versions) in &by_name {
            let Some(pinned) = pins.get(*name) else {
                continue;
            };
            live.insert((*name, pinned));
            for older in versions.iter().rev().filter(|v| **v < pinned).take(keep_previous) {
                live.insert((*name, *older));
            }
        }

        let mut report = PruneReport::default();
        for key in &all {
            if !live.contains(&(key.name.as_str(), &key.version)) {
                report.candidates.push(key.clone());
            }
        }

        if !dry_run {
            for key in &report.candidates {
                if should_stop() {
                    break;
                }
                self.store.remove(key)?;
                report.removed += 1;
            }
        }

        if !report.candidates.is_empty() {
            tracing::info!(
                "retention: {} candidate(s), {} removed",
                report.candidates.len(),
                report.removed
            );
        }
        Ok(report)
    }
}
