//! Compatibility checks for a proposed version change.
//!
//! The resolver validates; it never searches for alternatives. Callers that
//! want a different candidate (the advisor) re-submit.

use depkeep_schema::{Constraint, Manifest, PackageName, Version};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

/// One constraint some dependent places on a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependent {
    /// Entry name, or the project name for top-level requirements.
    pub dependent: String,
    pub constraint: Constraint,
}

/// A dependency of the candidate whose current pin the candidate rejects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmetDependency {
    pub dependency: PackageName,
    pub constraint: Constraint,
    pub pinned: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    pub dependency: PackageName,
    pub requested: Version,
    /// Every (dependent, constraint) pair the requested version fails.
    pub rejections: Vec<Dependent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unmet: Vec<UnmetDependency>,
}

impl ConflictReport {
    pub fn is_conflict(&self) -> bool {
        !self.rejections.is_empty() || !self.unmet.is_empty()
    }

    /// Human-readable listing of every failing constraint.
    pub fn describe(&self) -> String {
        let mut out = format!("{}@{} conflicts:", self.dependency, self.requested);
        for r in &self.rejections {
            let _ = write!(out, "\n  {} requires {} {}", r.dependent, self.dependency, r.constraint);
        }
        for u in &self.unmet {
            let _ = write!(
                out,
                "\n  requires {} {} but {} is pinned",
                u.dependency, u.constraint, u.pinned
            );
        }
        out
    }
}

/// Dependents index over one frozen manifest snapshot.
///
/// Read-only after construction, so a single resolver can be shared across
/// worker threads checking different candidates.
pub struct ConflictResolver {
    project: String,
    dependents: HashMap<PackageName, Vec<Dependent>>,
    pins: HashMap<PackageName, Version>,
}

impl ConflictResolver {
    pub fn new(manifest: &Manifest) -> Self {
        let mut dependents: HashMap<PackageName, Vec<Dependent>> = HashMap::new();

        for req in &manifest.requirements {
            dependents.entry(req.name.clone()).or_default().push(Dependent {
                dependent: manifest.project.clone(),
                constraint: req.constraint.clone(),
            });
        }
        for entry in &manifest.entries {
            for (dep, constraint) in &entry.dependencies {
                if *dep == entry.name {
                    continue;
                }
                dependents.entry(dep.clone()).or_default().push(Dependent {
                    dependent: entry.name.to_string(),
                    constraint: constraint.clone(),
                });
            }
        }

        let pins = manifest
            .entries
            .iter()
            .map(|e| (e.name.clone(), e.version.clone()))
            .collect();

        Self {
            project: manifest.project.clone(),
            dependents,
            pins,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Every constraint placed on `name`, in manifest order.
    pub fn dependents_of(&self, name: &str) -> &[Dependent] {
        self.dependents.get(name).map_or(&[], Vec::as_slice)
    }

    /// Test `candidate` against every constraint on `name`.
    pub fn check(&self, name: &str, candidate: &Version) -> ConflictReport {
        let rejections = self
            .dependents_of(name)
            .iter()
            .filter(|d| !d.constraint.matches(candidate))
            .cloned()
            .collect();
        ConflictReport {
            dependency: PackageName::new(name),
            requested: candidate.clone(),
            rejections,
            unmet: Vec::new(),
        }
    }

    /// [`check`](Self::check) plus the forward direction: the constraints
    /// the candidate version itself declares must hold for the current pins.
    /// Dependencies the manifest does not pin are not checked.
    pub fn check_transition(
        &self,
        name: &str,
        candidate: &Version,
        candidate_deps: &BTreeMap<PackageName, Constraint>,
    ) -> ConflictReport {
        let mut report = self.check(name, candidate);
        for (dep, constraint) in candidate_deps {
            if *dep == name {
                continue;
            }
            if let Some(pinned) = self.pins.get(dep.as_str()) {
                if !constraint.matches(pinned) {
                    report.unmet.push(UnmetDependency {
                        dependency: dep.clone(),
                        constraint: constraint.clone(),
                        pinned: pinned.clone(),
                    });
                }
            }
        }
        if report.is_conflict() {
            tracing::debug!("{}", report.describe());
        }
        report
    }
}
