//! Core pipeline for depkeep.
//!
//! This crate ties the manifest model, the registry client, and the artifact
//! store together into the pipeline stages: drift detection, conflict
//! checking, upgrade advice and ranking, the safe upgrade orchestrator with
//! its state machine, preflight validation, wheelhouse bundling, and mirror
//! synchronization. External collaborators (advisory feed, signature index,
//! policy gate) are traits with no-op defaults in [`collab`].

pub mod bundler;
pub mod collab;
pub mod concurrency;
pub mod config;
pub mod conflict;
pub mod drift;
pub mod lifecycle;
pub mod mirror;
pub mod orchestrator;
pub mod planner;
pub mod preflight;

pub use bundler::{verify_bundle, BundleEntry, BundleManifest, BundleVerification, Bundler, BundlerConfig};
pub use collab::{
    AdvisoryFeed, AllowAll, DenyList, GateError, NoAdvisories, NoSignatures, PolicyFinding,
    PolicyGate, SignatureIndex, StaticAdvisories, StaticSignatures,
};
pub use concurrency::{CancelToken, StoreLock};
pub use config::PipelineConfig;
pub use conflict::{ConflictReport, ConflictResolver, Dependent, UnmetDependency};
pub use drift::{DriftConfig, DriftDetector, DriftRecord, DriftReport, DriftSeverity};
pub use lifecycle::{validate_transition, OrchestrationState};
pub use mirror::{verify_mirror, MirrorConfig, MirrorManager, SyncFailure, SyncReport};
pub use orchestrator::{
    CommitPolicy, Orchestrator, OrchestratorConfig, RollbackReason, StepFailure, UpgradeOutcome,
};
pub use planner::{
    Advisor, Candidate, Plan, Planner, PlannerConfig, Proposal, SkipReason, Skipped,
    UpgradePlanStep,
};
pub use preflight::{
    PolicyContext, PreflightConfig, PreflightResult, PreflightValidator, Violation, ViolationCode,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] depkeep_schema::ManifestError),
    #[error("store error: {0}")]
    Store(#[from] depkeep_store::StoreError),
    #[error("registry error: {0}")]
    Registry(#[from] depkeep_registry::RegistryError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    /// A fetched or cached artifact does not match its pinned digest.
    #[error("integrity failure for {artifact}: expected {expected}, got {actual}")]
    Integrity {
        artifact: String,
        expected: String,
        actual: String,
    },
    #[error("preflight unavailable: {0}")]
    PreflightUnavailable(String),
    #[error("refusing to continue: preflight reported {0} violation(s)")]
    PreflightNotPassed(usize),
    #[error("config error: {0}")]
    Config(String),
    #[error("worker pool error: {0}")]
    WorkerPool(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Integrity and commit-path failures that must end a run with no
    /// partial output.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            CoreError::Integrity { .. }
                | CoreError::Store(depkeep_store::StoreError::IntegrityFailure { .. })
        )
    }
}

/// Map a store read failure, keeping digest mismatches distinguishable.
pub(crate) fn store_read_error(e: depkeep_store::StoreError) -> CoreError {
    match e {
        depkeep_store::StoreError::IntegrityFailure {
            key,
            expected,
            actual,
        } => CoreError::Integrity {
            artifact: key,
            expected,
            actual,
        },
        other => CoreError::Store(other),
    }
}
