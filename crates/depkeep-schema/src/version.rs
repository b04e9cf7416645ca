use crate::manifest::ManifestError;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Parse a version string, padding missing components.
///
/// Registries commonly publish two-component versions (`2.31`); these are
/// read as `2.31.0`. A leading `v` is ignored.
pub fn parse_version(input: &str) -> Result<Version, ManifestError> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let split = trimmed
        .find(|c: char| c == '-' || c == '+')
        .unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);
    let padded = match core.split('.').count() {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => trimmed.to_owned(),
    };
    Version::parse(&padded).map_err(|e| ManifestError::InvalidVersion {
        input: input.to_owned(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConstraintKind {
    Any,
    Exact(Version),
    Range(VersionReq),
}

/// A version constraint expression: wildcard, exact pin, or semver range.
///
/// Accepted forms:
/// - `*` or an empty string: any version
/// - `==1.2.0` / `=1.2.0`: exactly that version (build metadata ignored)
/// - anything else: a comma-separated semver range such as `>=1.0, <1.3`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Constraint {
    raw: String,
    kind: ConstraintKind,
}

impl Constraint {
    pub fn parse(input: &str) -> Result<Self, ManifestError> {
        let raw = input.trim().to_owned();
        if raw.is_empty() || raw == "*" {
            return Ok(Self {
                raw: "*".to_owned(),
                kind: ConstraintKind::Any,
            });
        }
        if let Some(pinned) = raw.strip_prefix("==").or_else(|| {
            // A single `=` is an exact pin only when nothing else follows a comma.
            raw.strip_prefix('=').filter(|rest| !rest.contains(','))
        }) {
            let version = parse_version(pinned)?;
            return Ok(Self {
                raw,
                kind: ConstraintKind::Exact(version),
            });
        }
        let req = VersionReq::parse(&raw).map_err(|e| ManifestError::InvalidConstraint {
            input: raw.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            raw,
            kind: ConstraintKind::Range(req),
        })
    }

    pub fn any() -> Self {
        Self {
            raw: "*".to_owned(),
            kind: ConstraintKind::Any,
        }
    }

    pub fn exact(version: &Version) -> Self {
        Self {
            raw: format!("=={version}"),
            kind: ConstraintKind::Exact(version.clone()),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self.kind, ConstraintKind::Any)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, version: &Version) -> bool {
        match &self.kind {
            ConstraintKind::Any => true,
            ConstraintKind::Exact(pinned) => {
                pinned.major == version.major
                    && pinned.minor == version.minor
                    && pinned.patch == version.patch
                    && pinned.pre == version.pre
            }
            ConstraintKind::Range(req) => req.matches(version),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for Constraint {
    type Error = ManifestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Constraint> for String {
    fn from(value: Constraint) -> Self {
        value.raw
    }
}

/// Serde adapter for `semver::Version` fields that accepts short versions.
pub mod lenient {
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(version: &Version, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(version)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Version, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_version(&raw).map_err(serde::de::Error::custom)
    }
}
