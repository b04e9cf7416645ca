use crate::collab::{AdvisoryFeed, PolicyFinding, PolicyGate};
use crate::conflict::ConflictReport;
use crate::drift::{DriftConfig, DriftDetector, DriftRecord, DriftReport};
use crate::planner::{Advisor, SkipReason, UpgradePlanStep};
use crate::CoreError;
use depkeep_registry::RegistryClient;
use depkeep_schema::{Manifest, PinnedEntry};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationCode {
    MissingHash,
    MissingSignature,
    PolicyViolation,
}

impl ViolationCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationCode::MissingHash => "MISSING_HASH",
            ViolationCode::MissingSignature => "MISSING_SIGNATURE",
            ViolationCode::PolicyViolation => "POLICY_VIOLATION",
        }
    }
}

impl fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub code: ViolationCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    pub message: String,
}

/// Aggregated outcome of one preflight run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightResult {
    pub passed: bool,
    pub violations: Vec<Violation>,
    pub hashes_complete: bool,
    pub signatures_present: bool,
}

impl PreflightResult {
    fn from_violations(violations: Vec<Violation>) -> Self {
        let has = |code| violations.iter().any(|v| v.code == code);
        Self {
            passed: violations.is_empty(),
            hashes_complete: !has(ViolationCode::MissingHash),
            signatures_present: !has(ViolationCode::MissingSignature),
            violations,
        }
    }

    pub fn codes(&self) -> Vec<ViolationCode> {
        self.violations.iter().map(|v| v.code).collect()
    }
}

/// The structured document handed to the policy gate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PolicyContext {
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_fingerprint: Option<String>,
    pub entries: Vec<PinnedEntry>,
    pub proposed_changes: Vec<UpgradePlanStep>,
    /// Drifted records only.
    pub drift_summary: Vec<DriftRecord>,
    /// For a standing manifest, the conflicts that hold drifted dependencies
    /// back. During an upgrade, the check run for each step so far.
    pub conflicts: Vec<ConflictReport>,
}

impl PolicyContext {
    pub fn for_manifest(manifest: &Manifest) -> Self {
        Self {
            project: manifest.project.clone(),
            manifest_fingerprint: manifest.fingerprint().ok(),
            entries: manifest.entries.clone(),
            ..Self::default()
        }
    }

    /// Context for a standing manifest with a fresh drift scan and the
    /// conflicts the advisor ran into.
    pub fn survey(
        manifest: &Manifest,
        registry: &dyn RegistryClient,
        advisories: &dyn AdvisoryFeed,
        config: &DriftConfig,
    ) -> Result<Self, CoreError> {
        let drift = DriftDetector::new(registry, advisories, config.clone()).scan(manifest)?;
        let proposal = Advisor::new(registry, config.clone()).propose(&drift, manifest)?;
        let conflicts = proposal
            .skipped
            .into_iter()
            .filter_map(|s| match s.reason {
                SkipReason::Conflict(report) => Some(report),
                SkipReason::Registry(_) | SkipReason::NoCandidate => None,
            })
            .collect();
        Ok(Self::for_manifest(manifest)
            .with_drift(&drift)
            .with_conflicts(conflicts))
    }

    #[must_use]
    pub fn with_changes(mut self, steps: &[UpgradePlanStep]) -> Self {
        self.proposed_changes = steps.to_vec();
        self
    }

    #[must_use]
    pub fn with_drift(mut self, report: &DriftReport) -> Self {
        self.drift_summary = report.drifted().cloned().collect();
        self
    }

    #[must_use]
    pub fn with_conflicts(mut self, conflicts: Vec<ConflictReport>) -> Self {
        self.conflicts = conflicts;
        self
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreflightConfig {
    /// Require a signature reference on every entry, not only on
    /// requirements marked `signed`.
    pub require_all_signed: bool,
}

/// Final gate before a manifest is committed or bundled.
///
/// Expected violations are reported in the result; only a gate transport
/// failure is an error.
pub struct PreflightValidator<'a> {
    gate: &'a dyn PolicyGate,
    config: PreflightConfig,
}

impl<'a> PreflightValidator<'a> {
    pub fn new(gate: &'a dyn PolicyGate, config: PreflightConfig) -> Self {
        Self { gate, config }
    }

    pub fn validate(
        &self,
        manifest: &Manifest,
        context: &PolicyContext,
    ) -> Result<PreflightResult, CoreError> {
        self.run(manifest, None, context)
    }

    /// Validate only the named entries. Gate findings about other entries
    /// are ignored; findings about the manifest as a whole are kept.
    pub fn validate_entries(
        &self,
        manifest: &Manifest,
        names: &[&str],
        context: &PolicyContext,
    ) -> Result<PreflightResult, CoreError> {
        self.run(manifest, Some(names), context)
    }

    fn run(
        &self,
        manifest: &Manifest,
        only: Option<&[&str]>,
        context: &PolicyContext,
    ) -> Result<PreflightResult, CoreError> {
        let selected = |name: &str| only.map_or(true, |names| names.iter().any(|n| *n == name));
        let platforms = manifest.required_platforms();
        let mut violations = Vec::new();

        for entry in manifest.entries.iter().filter(|e| selected(e.name.as_str())) {
            for platform in &platforms {
                if entry.hash_for(platform).is_none() {
                    violations.push(Violation {
                        code: ViolationCode::MissingHash,
                        dependency: Some(entry.name.to_string()),
                        message: format!(
                            "{}@{} has no hash for platform '{platform}'",
                            entry.name, entry.version
                        ),
                    });
                }
            }

            let must_sign = self.config.require_all_signed
                || manifest.requirement(&entry.name).is_some_and(|r| r.signed);
            let signed = entry.signature.as_deref().is_some_and(|s| !s.trim().is_empty());
            if must_sign && !signed {
                violations.push(Violation {
                    code: ViolationCode::MissingSignature,
                    dependency: Some(entry.name.to_string()),
                    message: format!("{}@{} has no signature reference", entry.name, entry.version),
                });
            }
        }

        let findings = self
            .gate
            .evaluate(context)
            .map_err(|e| CoreError::PreflightUnavailable(e.0))?;
        violations.extend(
            findings
                .into_iter()
                .filter(|f| f.dependency.as_deref().map_or(true, selected))
                .map(|PolicyFinding { dependency, message }| Violation {
                    code: ViolationCode::PolicyViolation,
                    dependency,
                    message,
                }),
        );

        let result = PreflightResult::from_violations(violations);
        if result.passed {
            tracing::debug!("preflight passed for '{}'", manifest.project);
        } else {
            tracing::warn!(
                "preflight failed for '{}': {} violation(s)",
                manifest.project,
                result.violations.len()
            );
        }
        Ok(result)
    }
}
