//! Upgrade candidates and their risk ranking.
//!
//! The [`Advisor`] turns drift into candidates the conflict resolver accepts
//! against the current manifest. The [`Planner`] only ranks; the orchestrator
//! re-checks every step against the working copy at execution time.

use crate::concurrency::worker_pool;
use crate::conflict::{ConflictReport, ConflictResolver};
use crate::drift::{DriftConfig, DriftRecord, DriftReport, DriftSeverity};
use crate::CoreError;
use depkeep_registry::RegistryClient;
use depkeep_schema::{Manifest, PackageName, Version};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A proposed version change that passed the conflict check.
///
/// `severity`, `age_days` and `advisory` come from the drift record, so a
/// dependency far behind its latest release ranks by that distance even
/// when only a smaller step is compatible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub name: PackageName,
    pub from: Version,
    pub to: Version,
    pub severity: DriftSeverity,
    pub age_days: u64,
    pub advisory: bool,
}

impl Candidate {
    fn from_record(record: &DriftRecord, to: Version) -> Self {
        Self {
            name: record.name.clone(),
            from: record.pinned.clone(),
            to,
            severity: record.severity,
            age_days: record.age_days,
            advisory: record.advisory,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Every newer version was rejected; carries the report for the last one tried.
    Conflict(ConflictReport),
    Registry(String),
    NoCandidate,
}

#[derive(Debug, Clone, Serialize)]
pub struct Skipped {
    pub name: PackageName,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Proposal {
    pub candidates: Vec<Candidate>,
    pub skipped: Vec<Skipped>,
}

enum Advice {
    Accept(Candidate),
    Skip(Skipped),
}

/// Picks, for each drifted dependency, the highest newer version the
/// manifest can accept.
pub struct Advisor<'a> {
    registry: &'a dyn RegistryClient,
    config: DriftConfig,
}

impl<'a> Advisor<'a> {
    pub fn new(registry: &'a dyn RegistryClient, config: DriftConfig) -> Self {
        Self { registry, config }
    }

    pub fn propose(&self, drift: &DriftReport, manifest: &Manifest) -> Result<Proposal, CoreError> {
        let resolver = ConflictResolver::new(manifest);
        let pool = worker_pool(self.config.workers)?;
        let advice: Vec<Option<Advice>> = pool.install(|| {
            drift
                .records
                .par_iter()
                .map(|record| self.advise(record, &resolver))
                .collect()
        });

        let mut proposal = Proposal::default();
        for item in advice.into_iter().flatten() {
            match item {
                Advice::Accept(c) => proposal.candidates.push(c),
                Advice::Skip(s) => proposal.skipped.push(s),
            }
        }
        tracing::info!(
            "{} upgrade candidate(s), {} skipped",
            proposal.candidates.len(),
            proposal.skipped.len()
        );
        Ok(proposal)
    }

    fn advise(&self, record: &DriftRecord, resolver: &ConflictResolver) -> Option<Advice> {
        let skip = |reason| {
            Some(Advice::Skip(Skipped {
                name: record.name.clone(),
                reason,
            }))
        };

        if let Some(err) = &record.lookup_error {
            return skip(SkipReason::Registry(err.clone()));
        }
        if !record.has_drift() {
            return None;
        }

        let mut versions = match self.registry.fetch_versions(&record.name) {
            Ok(v) => v,
            Err(e) => return skip(SkipReason::Registry(e.to_string())),
        };
        versions.retain(|info| info.version > record.pinned && self.config.eligible(info, &record.pinned));
        versions.sort_by(|a, b| b.version.cmp(&a.version));

        let mut last_conflict = None;
        for info in &versions {
            let report = resolver.check_transition(&record.name, &info.version, &info.dependencies);
            if !report.is_conflict() {
                tracing::debug!("{}: {} -> {} accepted", record.name, record.pinned, info.version);
                return Some(Advice::Accept(Candidate::from_record(record, info.version.clone())));
            }
            last_conflict = Some(report);
        }

        match last_conflict {
            Some(report) => skip(SkipReason::Conflict(report)),
            None => skip(SkipReason::NoCandidate),
        }
    }
}

/// One atomic unit of an upgrade plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradePlanStep {
    pub name: PackageName,
    #[serde(with = "depkeep_schema::version::lenient")]
    pub from: Version,
    #[serde(with = "depkeep_schema::version::lenient")]
    pub to: Version,
    pub score: u64,
    pub rationale: String,
}

/// Ordered steps, applied first to last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<UpgradePlanStep>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let json = serde_json::to_string_pretty(self)?;
        depkeep_store::write_atomic(path, json.as_bytes())?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlannerConfig {
    pub major_weight: u64,
    pub minor_weight: u64,
    pub patch_weight: u64,
    /// Added for candidates whose pinned version has a known advisory.
    pub advisory_bonus: u64,
    pub age_divisor_days: u64,
    pub age_cap: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            major_weight: 300,
            minor_weight: 200,
            patch_weight: 100,
            advisory_bonus: 10_000,
            age_divisor_days: 30,
            age_cap: 99,
        }
    }
}

pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Rank candidates by risk score, highest first. Equal scores are
    /// ordered by dependency name.
    pub fn plan(&self, candidates: &[Candidate]) -> Plan {
        let mut steps: Vec<UpgradePlanStep> = candidates.iter().map(|c| self.step_for(c)).collect();
        steps.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        Plan { steps }
    }

    fn step_for(&self, candidate: &Candidate) -> UpgradePlanStep {
        let severity = candidate.severity;
        let distance = match severity {
            DriftSeverity::Major => self.config.major_weight,
            DriftSeverity::Minor => self.config.minor_weight,
            DriftSeverity::Patch => self.config.patch_weight,
            DriftSeverity::None => 0,
        };
        let mut score = distance;
        let mut parts = vec![format!("{} drift (+{distance})", severity.as_str())];

        if candidate.advisory {
            score += self.config.advisory_bonus;
            parts.push(format!("known advisory (+{})", self.config.advisory_bonus));
        }

        let age = (candidate.age_days / self.config.age_divisor_days.max(1)).min(self.config.age_cap);
        if age > 0 {
            score += age;
            parts.push(format!("pinned {} days (+{age})", candidate.age_days));
        }

        UpgradePlanStep {
            name: candidate.name.clone(),
            from: candidate.from.clone(),
            to: candidate.to.clone(),
            score,
            rationale: parts.join(", "),
        }
    }
}
