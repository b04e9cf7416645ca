//! Safe upgrade execution.
//!
//! A plan runs step by step against a working copy of the committed
//! manifest. Each step is validated against the working copy as it stands,
//! applied, and verified before the next one starts. The committed file is
//! written only through [`ManifestFile::commit`], which replaces it
//! atomically, so a rollback never has anything on disk to undo.

use crate::collab::SignatureIndex;
use crate::concurrency::{CancelToken, StoreLock};
use crate::conflict::{ConflictReport, ConflictResolver};
use crate::drift::DriftReport;
use crate::lifecycle::{validate_transition, OrchestrationState};
use crate::planner::{Plan, UpgradePlanStep};
use crate::preflight::{PolicyContext, PreflightResult, PreflightValidator};
use crate::CoreError;
use depkeep_registry::{RegistryClient, VersionInfo};
use depkeep_schema::{Manifest, ManifestFile, PackageName, PinnedEntry, Platform, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Persist once, after every step has been verified.
    #[default]
    AllOrNothing,
    /// Persist after each verified step. A later failure keeps the earlier
    /// steps.
    Incremental,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub commit_policy: CommitPolicy,
    /// Run-level deadline, checked before each step starts.
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RollbackReason {
    Conflict(ConflictReport),
    PreflightFailed(PreflightResult),
    /// The working copy no longer pins the step's `from` version.
    StalePlan {
        expected: Version,
        found: Option<Version>,
    },
    Registry(String),
    Cancelled,
    DeadlineExceeded,
}

impl RollbackReason {
    pub fn describe(&self) -> String {
        match self {
            RollbackReason::Conflict(report) => report.describe(),
            RollbackReason::PreflightFailed(result) => result
                .violations
                .iter()
                .map(|v| format!("{}: {}", v.code, v.message))
                .collect::<Vec<_>>()
                .join("; "),
            RollbackReason::StalePlan { expected, found } => match found {
                Some(found) => format!("plan expects {expected} but {found} is pinned"),
                None => format!("plan expects {expected} but the dependency is not pinned"),
            },
            RollbackReason::Registry(msg) => msg.clone(),
            RollbackReason::Cancelled => "cancelled".to_owned(),
            RollbackReason::DeadlineExceeded => "deadline exceeded".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub index: usize,
    pub dependency: PackageName,
    /// State the step was in when it failed.
    pub state: OrchestrationState,
    pub reason: RollbackReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeOutcome {
    pub final_state: OrchestrationState,
    /// Steps whose result is in the committed manifest.
    pub applied: Vec<UpgradePlanStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
    /// Every state entered, starting with `Pending`.
    pub transitions: Vec<OrchestrationState>,
    /// The committed manifest at the end of the run.
    pub manifest: Manifest,
}

impl UpgradeOutcome {
    pub fn is_committed(&self) -> bool {
        self.final_state == OrchestrationState::Committed
    }
}

struct Run {
    state: OrchestrationState,
    transitions: Vec<OrchestrationState>,
}

impl Run {
    fn new() -> Self {
        Self {
            state: OrchestrationState::Pending,
            transitions: vec![OrchestrationState::Pending],
        }
    }

    fn advance(&mut self, to: OrchestrationState) -> Result<(), CoreError> {
        validate_transition(self.state, to)?;
        tracing::debug!("orchestration {} -> {to}", self.state);
        self.state = to;
        self.transitions.push(to);
        Ok(())
    }
}

pub struct Orchestrator<'a> {
    registry: &'a dyn RegistryClient,
    preflight: &'a PreflightValidator<'a>,
    signatures: &'a dyn SignatureIndex,
    config: OrchestratorConfig,
    cancel: CancelToken,
    drift: Option<DriftReport>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        registry: &'a dyn RegistryClient,
        preflight: &'a PreflightValidator<'a>,
        signatures: &'a dyn SignatureIndex,
        config: OrchestratorConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            registry,
            preflight,
            signatures,
            config,
            cancel,
            drift: None,
        }
    }

    /// Drift scan of the committed manifest, passed to the policy gate at
    /// every verification.
    #[must_use]
    pub fn with_drift(mut self, report: DriftReport) -> Self {
        self.drift = Some(report);
        self
    }

    /// Execute `plan` against the manifest in `file`.
    ///
    /// Expected failures (conflicts, preflight violations, registry errors,
    /// cancellation) end in `RolledBack` and are returned as an outcome.
    /// Preflight transport failures and commit errors are returned as `Err`;
    /// in both cases the committed file is left as it was.
    pub fn execute(&self, file: &ManifestFile, plan: &Plan) -> Result<UpgradeOutcome, CoreError> {
        let _lock = StoreLock::acquire(&file.lock_path())?;
        let mut committed = file.load()?;
        let mut run = Run::new();

        if plan.is_empty() {
            run.advance(OrchestrationState::Committed)?;
            tracing::info!("empty plan, nothing to apply");
            return Ok(UpgradeOutcome {
                final_state: run.state,
                applied: Vec::new(),
                failure: None,
                transitions: run.transitions,
                manifest: committed,
            });
        }

        let started = Instant::now();
        let deadline = self.config.deadline_secs.map(Duration::from_secs);
        let mut working = committed.clone();
        let mut applied = Vec::new();
        let mut checks: Vec<ConflictReport> = Vec::new();

        for (index, step) in plan.steps.iter().enumerate() {
            // Under all-or-nothing nothing verified so far reaches the file.
            let fail = |run: Run, applied: Vec<UpgradePlanStep>, committed: Manifest, reason| {
                let kept = match self.config.commit_policy {
                    CommitPolicy::Incremental => applied,
                    CommitPolicy::AllOrNothing => Vec::new(),
                };
                Self::roll_back(run, index, step, reason, kept, committed)
            };

            if self.cancel.is_cancelled() {
                return fail(run, applied, committed, RollbackReason::Cancelled);
            }
            if deadline.is_some_and(|d| started.elapsed() >= d) {
                return fail(run, applied, committed, RollbackReason::DeadlineExceeded);
            }

            run.advance(OrchestrationState::Validating)?;
            let info = match self.validate_step(&working, step) {
                Ok((info, check)) => {
                    checks.push(check);
                    info
                }
                Err(reason) => return fail(run, applied, committed, reason),
            };

            run.advance(OrchestrationState::Applying)?;
            if let Err(reason) = self.apply_step(&mut working, step, &info) {
                return fail(run, applied, committed, reason);
            }

            run.advance(OrchestrationState::Verifying)?;
            let mut context = PolicyContext::for_manifest(&working)
                .with_changes(&plan.steps[..=index])
                .with_conflicts(checks.clone());
            if let Some(drift) = &self.drift {
                context = context.with_drift(drift);
            }
            let result = self
                .preflight
                .validate_entries(&working, &[step.name.as_str()], &context)?;
            if !result.passed {
                return fail(run, applied, committed, RollbackReason::PreflightFailed(result));
            }

            tracing::info!("step {}: {} {} -> {} verified", index + 1, step.name, step.from, step.to);
            applied.push(step.clone());

            if self.config.commit_policy == CommitPolicy::Incremental {
                file.commit(&working)?;
                committed = working.clone();
            }
        }

        if self.config.commit_policy == CommitPolicy::AllOrNothing {
            file.commit(&working)?;
            committed = working;
        }
        run.advance(OrchestrationState::Committed)?;
        tracing::info!("committed {} upgrade(s) to {}", applied.len(), file.path().display());

        Ok(UpgradeOutcome {
            final_state: run.state,
            applied,
            failure: None,
            transitions: run.transitions,
            manifest: committed,
        })
    }

    /// Returns the version metadata and the clean conflict check for `step`.
    fn validate_step(
        &self,
        working: &Manifest,
        step: &UpgradePlanStep,
    ) -> Result<(VersionInfo, ConflictReport), RollbackReason> {
        let found = working.entry(&step.name).map(|e| e.version.clone());
        if found.as_ref() != Some(&step.from) {
            return Err(RollbackReason::StalePlan {
                expected: step.from.clone(),
                found,
            });
        }

        let info = self
            .registry
            .fetch_version(&step.name, &step.to)
            .map_err(|e| RollbackReason::Registry(e.to_string()))?;
        if info.yanked {
            return Err(RollbackReason::Registry(format!("{}@{} is yanked", step.name, step.to)));
        }

        // The resolver is rebuilt from the working copy so earlier steps of
        // this plan are taken into account.
        let report = ConflictResolver::new(working).check_transition(&step.name, &step.to, &info.dependencies);
        if report.is_conflict() {
            return Err(RollbackReason::Conflict(report));
        }
        Ok((info, report))
    }

    fn apply_step(
        &self,
        working: &mut Manifest,
        step: &UpgradePlanStep,
        info: &VersionInfo,
    ) -> Result<(), RollbackReason> {
        let platforms: Vec<Platform> = match working.entry(&step.name) {
            Some(previous) if !previous.hashes.is_empty() => previous.hashes.keys().cloned().collect(),
            _ => working.required_platforms(),
        };

        let mut hashes = BTreeMap::new();
        for platform in platforms {
            let digest = self
                .registry
                .fetch_artifact_hash(&step.name, &step.to, &platform)
                .map_err(|e| RollbackReason::Registry(e.to_string()))?;
            hashes.insert(platform, digest);
        }

        working.set_entry(PinnedEntry {
            name: step.name.clone(),
            version: step.to.clone(),
            provenance: self.registry.name().to_owned(),
            signature: self.signatures.signature_for(&step.name, &step.to),
            hashes,
            dependencies: info.dependencies.clone(),
        });
        Ok(())
    }

    fn roll_back(
        mut run: Run,
        index: usize,
        step: &UpgradePlanStep,
        reason: RollbackReason,
        applied: Vec<UpgradePlanStep>,
        committed: Manifest,
    ) -> Result<UpgradeOutcome, CoreError> {
        let failed_in = run.state;
        run.advance(OrchestrationState::RollingBack)?;
        tracing::warn!(
            "step {} ({}) failed while {failed_in}: {}; discarding working copy",
            index + 1,
            step.name,
            reason.describe()
        );
        run.advance(OrchestrationState::RolledBack)?;

        Ok(UpgradeOutcome {
            final_state: run.state,
            applied,
            failure: Some(StepFailure {
                index,
                dependency: step.name.clone(),
                state: failed_in,
                reason,
            }),
            transitions: run.transitions,
            manifest: committed,
        })
    }
}
