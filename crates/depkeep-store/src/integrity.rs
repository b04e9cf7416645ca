use crate::artifacts::{ArtifactKey, ArtifactStore};
use crate::StoreError;
use depkeep_schema::Digest;

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub checked: usize,
    pub passed: usize,
    pub missing: Vec<ArtifactKey>,
    pub failed: Vec<IntegrityFailure>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
pub struct IntegrityFailure {
    pub key: ArtifactKey,
    pub reason: String,
}

/// Re-hash every expected artifact that is present in the store.
///
/// Missing artifacts are listed but are not failures; a mismatching or
/// unreadable object is.
pub fn verify_artifacts(
    store: &ArtifactStore,
    expected: &[(ArtifactKey, Digest)],
) -> Result<IntegrityReport, StoreError> {
    let mut report = IntegrityReport::default();

    for (key, digest) in expected {
        if !store.exists(key) {
            report.missing.push(key.clone());
            continue;
        }
        report.checked += 1;
        match store.get_verified(key, digest) {
            Ok(_) => report.passed += 1,
            Err(StoreError::IntegrityFailure { actual, .. }) => {
                report.failed.push(IntegrityFailure {
                    key: key.clone(),
                    reason: format!("artifact hash mismatch: got {actual}"),
                });
            }
            Err(e) => {
                report.failed.push(IntegrityFailure {
                    key: key.clone(),
                    reason: format!("artifact read error: {e}"),
                });
            }
        }
    }

    Ok(report)
}
