//! Package registry access for depkeep.
//!
//! This crate provides the `RegistryClient` trait the pipeline is written
//! against, an HTTP implementation for live registries, an `IndexRegistry`
//! for offline snapshots and tests, configuration for registry endpoints with
//! optional authentication, and the explicit `RetryPolicy` used for transient
//! failures. Nothing here caches results; caching belongs to the mirror.

pub mod config;
pub mod http;
pub mod index;
pub mod retry;

pub use config::RegistryConfig;
pub use http::HttpRegistry;
pub use index::IndexRegistry;
pub use retry::RetryPolicy;

use chrono::{DateTime, Utc};
use depkeep_schema::{Constraint, Digest, PackageName, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Protocol version sent as `X-Depkeep-Protocol` header on all HTTP requests.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Network or transport failure. Retryable.
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error("package not found: {0}")]
    PackageNotFound(String),
    #[error("version {version} of '{name}' not found")]
    VersionNotFound { name: String, version: String },
    #[error("no artifact for {name}@{version} on platform '{platform}'")]
    ArtifactNotFound {
        name: String,
        version: String,
        platform: String,
    },
    #[error("registry protocol error: {0}")]
    Protocol(String),
    #[error("registry config error: {0}")]
    Config(String),
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Unavailable(_))
    }
}

/// One published version of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(with = "depkeep_schema::version::lenient")]
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub yanked: bool,
    /// Constraints this version declares on other packages.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<PackageName, Constraint>,
}

impl VersionInfo {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            published_at: None,
            yanked: false,
            dependencies: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn published(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }

    #[must_use]
    pub fn yanked(mut self) -> Self {
        self.yanked = true;
        self
    }

    #[must_use]
    pub fn depends_on(mut self, name: &str, constraint: Constraint) -> Self {
        self.dependencies.insert(PackageName::new(name), constraint);
        self
    }
}

/// Read access to a package index.
///
/// Implementations must be shareable across the worker pools used for drift
/// scans and artifact fetches.
pub trait RegistryClient: Send + Sync {
    /// Label recorded as provenance on entries resolved through this client.
    fn name(&self) -> &str;

    /// All published versions of `name`, ascending. Fails with
    /// `PackageNotFound` when nothing is published under the name.
    fn fetch_versions(&self, name: &str) -> Result<Vec<VersionInfo>, RegistryError>;

    fn fetch_artifact_hash(
        &self,
        name: &str,
        version: &Version,
        platform: &str,
    ) -> Result<Digest, RegistryError>;

    fn fetch_artifact(
        &self,
        name: &str,
        version: &Version,
        platform: &str,
    ) -> Result<Vec<u8>, RegistryError>;

    /// Metadata for one exact version.
    fn fetch_version(&self, name: &str, version: &Version) -> Result<VersionInfo, RegistryError> {
        self.fetch_versions(name)?
            .into_iter()
            .find(|v| v.version == *version)
            .ok_or_else(|| RegistryError::VersionNotFound {
                name: name.to_owned(),
                version: version.to_string(),
            })
    }
}
