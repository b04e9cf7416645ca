use crate::collab::AdvisoryFeed;
use crate::concurrency::worker_pool;
use crate::CoreError;
use chrono::{DateTime, Utc};
use depkeep_registry::{RegistryClient, VersionInfo};
use depkeep_schema::{Manifest, PackageName, PinnedEntry, Version};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Semver distance between a pinned version and a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    None,
    Patch,
    Minor,
    Major,
}

impl DriftSeverity {
    /// Classify the move from `from` to `to` by the first differing
    /// component. Anything that is not an upgrade is `None`.
    pub fn between(from: &Version, to: &Version) -> Self {
        if to <= from {
            DriftSeverity::None
        } else if to.major != from.major {
            DriftSeverity::Major
        } else if to.minor != from.minor {
            DriftSeverity::Minor
        } else {
            DriftSeverity::Patch
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DriftSeverity::None => "none",
            DriftSeverity::Patch => "patch",
            DriftSeverity::Minor => "minor",
            DriftSeverity::Major => "major",
        }
    }
}

/// Drift state of one pinned dependency.
#[derive(Debug, Clone, Serialize)]
pub struct DriftRecord {
    pub name: PackageName,
    pub pinned: Version,
    /// Highest eligible published version; `None` when the lookup failed or
    /// nothing eligible is published.
    pub latest: Option<Version>,
    pub severity: DriftSeverity,
    /// Days since the pinned version was published, 0 when unknown.
    pub age_days: u64,
    pub advisory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookup_error: Option<String>,
}

impl DriftRecord {
    pub fn has_drift(&self) -> bool {
        self.severity != DriftSeverity::None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// One record per manifest entry, in manifest order.
    pub records: Vec<DriftRecord>,
    pub scanned_at: DateTime<Utc>,
}

impl DriftReport {
    pub fn record(&self, name: &str) -> Option<&DriftRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn drifted(&self) -> impl Iterator<Item = &DriftRecord> {
        self.records.iter().filter(|r| r.has_drift())
    }

    pub fn lookup_failures(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.lookup_error.is_some())
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriftConfig {
    /// Consider prerelease versions as upgrade targets.
    pub include_prereleases: bool,
    /// Size of the worker pool for registry lookups.
    pub workers: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            include_prereleases: false,
            workers: 8,
        }
    }
}

impl DriftConfig {
    /// Whether `candidate` may be offered as an upgrade from `pinned`.
    /// Prereleases qualify when configured or when already pinned to one.
    pub(crate) fn eligible(&self, info: &VersionInfo, pinned: &Version) -> bool {
        !info.yanked
            && (self.include_prereleases
                || info.version.pre.is_empty()
                || !pinned.pre.is_empty())
    }
}

/// Compares a manifest against live registry state.
///
/// Read-only and free of side effects; every scan produces exactly one record
/// per manifest entry, including entries whose lookup failed.
pub struct DriftDetector<'a> {
    registry: &'a dyn RegistryClient,
    advisories: &'a dyn AdvisoryFeed,
    config: DriftConfig,
}

impl<'a> DriftDetector<'a> {
    pub fn new(
        registry: &'a dyn RegistryClient,
        advisories: &'a dyn AdvisoryFeed,
        config: DriftConfig,
    ) -> Self {
        Self {
            registry,
            advisories,
            config,
        }
    }

    pub fn scan(&self, manifest: &Manifest) -> Result<DriftReport, CoreError> {
        self.scan_at(manifest, Utc::now())
    }

    /// Scan with a fixed clock for age computation.
    pub fn scan_at(&self, manifest: &Manifest, now: DateTime<Utc>) -> Result<DriftReport, CoreError> {
        let pool = worker_pool(self.config.workers)?;
        let records: Vec<DriftRecord> = pool.install(|| {
            manifest
                .entries
                .par_iter()
                .map(|entry| self.record_for(entry, now))
                .collect()
        });

        let drifted = records.iter().filter(|r| r.has_drift()).count();
        tracing::info!(
            "drift scan of '{}': {} entries, {drifted} drifted",
            manifest.project,
            records.len()
        );
        Ok(DriftReport {
            records,
            scanned_at: now,
        })
    }

    fn record_for(&self, entry: &PinnedEntry, now: DateTime<Utc>) -> DriftRecord {
        let advisory = self.advisories.is_affected(&entry.name, &entry.version);
        let mut record = DriftRecord {
            name: entry.name.clone(),
            pinned: entry.version.clone(),
            latest: None,
            severity: DriftSeverity::None,
            age_days: 0,
            advisory,
            lookup_error: None,
        };

        let versions = match self.registry.fetch_versions(&entry.name) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("drift lookup for '{}' failed: {e}", entry.name);
                record.lookup_error = Some(e.to_string());
                return record;
            }
        };

        record.latest = versions
            .iter()
            .filter(|info| self.config.eligible(info, &entry.version))
            .map(|info| &info.version)
            .max()
            .cloned();
        if let Some(latest) = &record.latest {
            record.severity = DriftSeverity::between(&entry.version, latest);
        }
        record.age_days = versions
            .iter()
            .find(|info| info.version == entry.version)
            .and_then(|info| info.published_at)
            .map_or(0, |published| {
                u64::try_from((now - published).num_days()).unwrap_or(0)
            });

        tracing::debug!(
            "{}: pinned {} latest {:?} severity {}",
            entry.name,
            entry.version,
            record.latest.as_ref().map(ToString::to_string),
            record.severity.as_str()
        );
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{NoAdvisories, StaticAdvisories};
    use chrono::TimeZone;
    use depkeep_registry::IndexRegistry;
    use depkeep_schema::Constraint;
    use std::collections::BTreeMap;

    fn v(s: &str) -> Version {
        depkeep_schema::parse_version(s).unwrap()
    }

    fn entry(name: &str, version: &str) -> PinnedEntry {
        PinnedEntry {
            name: name.into(),
            version: v(version),
            provenance: "test".to_owned(),
            signature: None,
            hashes: BTreeMap::new(),
            dependencies: BTreeMap::new(),
        }
    }

    fn manifest(entries: Vec<PinnedEntry>) -> Manifest {
        let mut m = Manifest::new("app", vec![]);
        m.entries = entries;
        m
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn severity_classification() {
        assert_eq!(DriftSeverity::between(&v("1.2.0"), &v("1.2.0")), DriftSeverity::None);
        assert_eq!(DriftSeverity::between(&v("1.2.0"), &v("1.1.0")), DriftSeverity::None);
        assert_eq!(DriftSeverity::between(&v("1.2.0"), &v("1.2.9")), DriftSeverity::Patch);
        assert_eq!(DriftSeverity::between(&v("1.2.0"), &v("1.4.0")), DriftSeverity::Minor);
        assert_eq!(DriftSeverity::between(&v("1.2.0"), &v("2.0.0")), DriftSeverity::Major);
        assert!(DriftSeverity::Major > DriftSeverity::Minor);
    }

    #[test]
    fn detects_minor_drift_with_age() {
        let mut registry = IndexRegistry::new("idx");
        registry
            .publish("libA", VersionInfo::new(v("1.2.0")).published(day(1)))
            .publish("libA", VersionInfo::new(v("1.4.0")).published(day(20)));

        let advisories = NoAdvisories;
        let detector = DriftDetector::new(&registry, &advisories, DriftConfig::default());
        let report = detector
            .scan_at(&manifest(vec![entry("libA", "1.2.0")]), day(31))
            .unwrap();

        let record = report.record("libA").unwrap();
        assert_eq!(record.severity, DriftSeverity::Minor);
        assert_eq!(record.latest, Some(v("1.4.0")));
        assert_eq!(record.age_days, 30);
        assert!(!record.advisory);
    }

    #[test]
    fn up_to_date_entries_still_get_a_record() {
        let mut registry = IndexRegistry::new("idx");
        registry.publish("libC", VersionInfo::new(v("3.0.0")));
        let advisories = NoAdvisories;
        let detector = DriftDetector::new(&registry, &advisories, DriftConfig::default());
        let report = detector
            .scan(&manifest(vec![entry("libC", "3.0.0")]))
            .unwrap();
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].severity, DriftSeverity::None);
        assert_eq!(report.records[0].age_days, 0);
    }

    #[test]
    fn lookup_failure_yields_record_not_error() {
        let registry = IndexRegistry::new("idx");
        let advisories = NoAdvisories;
        let detector = DriftDetector::new(&registry, &advisories, DriftConfig::default());
        let report = detector
            .scan(&manifest(vec![entry("ghost", "1.0.0")]))
            .unwrap();
        assert_eq!(report.records.len(), 1);
        assert!(report.records[0].lookup_error.is_some());
        assert_eq!(report.records[0].severity, DriftSeverity::None);
        assert_eq!(report.lookup_failures(), 1);
    }

    #[test]
    fn yanked_and_prerelease_versions_are_skipped() {
        let mut registry = IndexRegistry::new("idx");
        registry
            .publish("libA", VersionInfo::new(v("1.0.0")))
            .publish("libA", VersionInfo::new(v("1.1.0")))
            .publish("libA", VersionInfo::new(v("1.2.0")).yanked())
            .publish("libA", VersionInfo::new(v("2.0.0-rc.1")));
        let advisories = NoAdvisories;

        let detector = DriftDetector::new(&registry, &advisories, DriftConfig::default());
        let report = detector.scan(&manifest(vec![entry("libA", "1.0.0")])).unwrap();
        assert_eq!(report.records[0].latest, Some(v("1.1.0")));

        let with_pre = DriftDetector::new(
            &registry,
            &advisories,
            DriftConfig {
                include_prereleases: true,
                ..DriftConfig::default()
            },
        );
        let report = with_pre.scan(&manifest(vec![entry("libA", "1.0.0")])).unwrap();
        assert_eq!(report.records[0].latest, Some(v("2.0.0-rc.1")));
        assert_eq!(report.records[0].severity, DriftSeverity::Major);
    }

    #[test]
    fn advisory_flag_comes_from_feed() {
        let mut registry = IndexRegistry::new("idx");
        registry.publish("libA", VersionInfo::new(v("1.2.0")));
        let feed = StaticAdvisories::new().with("libA", "GHSA-x", Constraint::parse("<=1.2.0").unwrap());
        let detector = DriftDetector::new(&registry, &feed, DriftConfig::default());
        let report = detector.scan(&manifest(vec![entry("libA", "1.2.0")])).unwrap();
        assert!(report.records[0].advisory);
    }

    #[test]
    fn records_follow_manifest_order() {
        let mut registry = IndexRegistry::new("idx");
        let names = ["zeta", "alpha", "mid", "beta", "omega"];
        for name in names {
            registry.publish(name, VersionInfo::new(v("1.0.0")));
        }
        let advisories = NoAdvisories;
        let detector = DriftDetector::new(
            &registry,
            &advisories,
            DriftConfig {
                workers: 3,
                ..DriftConfig::default()
            },
        );
        let m = manifest(names.iter().map(|n| entry(n, "1.0.0")).collect());
        let report = detector.scan(&m).unwrap();
        let order: Vec<&str> = report.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(order, names);
    }
}
