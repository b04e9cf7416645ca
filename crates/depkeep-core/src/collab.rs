//! External collaborators consumed as pre-computed findings.
//!
//! Each collaborator is a trait with a no-op implementation so the pipeline
//! degrades gracefully when a feed is not configured, plus a static
//! implementation loaded from JSON for offline use and tests.

use crate::preflight::PolicyContext;
use crate::CoreError;
use depkeep_schema::{Constraint, PackageName, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Known-vulnerability lookups.
pub trait AdvisoryFeed: Send + Sync {
    /// Whether `version` of `name` is affected by a known advisory.
    fn is_affected(&self, name: &str, version: &Version) -> bool;
}

/// Signature references for published artifacts.
pub trait SignatureIndex: Send + Sync {
    fn signature_for(&self, name: &str, version: &Version) -> Option<String>;
}

#[derive(Debug, Error)]
#[error("policy gate unavailable: {0}")]
pub struct GateError(pub String);

/// A single finding returned by the policy gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFinding {
    /// `None` for findings about the manifest as a whole.
    #[serde(default)]
    pub dependency: Option<String>,
    pub message: String,
}

/// Policy evaluation over the context document assembled by preflight.
pub trait PolicyGate: Send + Sync {
    fn evaluate(&self, context: &PolicyContext) -> Result<Vec<PolicyFinding>, GateError>;
}

pub struct NoAdvisories;

impl AdvisoryFeed for NoAdvisories {
    fn is_affected(&self, _name: &str, _version: &Version) -> bool {
        false
    }
}

pub struct NoSignatures;

impl SignatureIndex for NoSignatures {
    fn signature_for(&self, _name: &str, _version: &Version) -> Option<String> {
        None
    }
}

pub struct AllowAll;

impl PolicyGate for AllowAll {
    fn evaluate(&self, _context: &PolicyContext) -> Result<Vec<PolicyFinding>, GateError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advisory {
    pub id: String,
    /// Versions affected by this advisory.
    pub affected: Constraint,
}

/// Advisory feed loaded from a JSON export: `{"<name>": [{"id", "affected"}]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticAdvisories {
    advisories: BTreeMap<PackageName, Vec<Advisory>>,
}

impl StaticAdvisories {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: &str, id: &str, affected: Constraint) -> Self {
        self.advisories
            .entry(PackageName::new(name))
            .or_default()
            .push(Advisory {
                id: id.to_owned(),
                affected,
            });
        self
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Advisory ids affecting `version` of `name`.
    pub fn advisories_for(&self, name: &str, version: &Version) -> Vec<&str> {
        self.advisories
            .get(name)
            .into_iter()
            .flatten()
            .filter(|a| a.affected.matches(version))
            .map(|a| a.id.as_str())
            .collect()
    }
}

impl AdvisoryFeed for StaticAdvisories {
    fn is_affected(&self, name: &str, version: &Version) -> bool {
        !self.advisories_for(name, version).is_empty()
    }
}

/// Signature index loaded from JSON: `{"<name>": {"<version>": "<reference>"}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticSignatures {
    signatures: BTreeMap<PackageName, BTreeMap<String, String>>,
}

impl StaticSignatures {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: &str, version: &Version, reference: &str) -> Self {
        self.signatures
            .entry(PackageName::new(name))
            .or_default()
            .insert(version.to_string(), reference.to_owned());
        self
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl SignatureIndex for StaticSignatures {
    fn signature_for(&self, name: &str, version: &Version) -> Option<String> {
        self.signatures
            .get(name)
            .and_then(|versions| versions.get(&version.to_string()))
            .cloned()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenyRule {
    pub name: PackageName,
    #[serde(default = "Constraint::any")]
    pub versions: Constraint,
    pub reason: String,
}

/// Minimal policy gate that rejects listed packages or version ranges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DenyList {
    #[serde(default)]
    pub rules: Vec<DenyRule>,
}

impl DenyList {
    #[must_use]
    pub fn deny(mut self, name: &str, versions: Constraint, reason: &str) -> Self {
        self.rules.push(DenyRule {
            name: PackageName::new(name),
            versions,
            reason: reason.to_owned(),
        });
        self
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl PolicyGate for DenyList {
    fn evaluate(&self, context: &PolicyContext) -> Result<Vec<PolicyFinding>, GateError> {
        let mut findings = Vec::new();
        for entry in &context.entries {
            for rule in &self.rules {
                if rule.name == entry.name && rule.versions.matches(&entry.version) {
                    findings.push(PolicyFinding {
                        dependency: Some(entry.name.to_string()),
                        message: format!("{}@{} denied: {}", entry.name, entry.version, rule.reason),
                    });
                }
            }
        }
        Ok(findings)
    }
}
