use crate::bundler::BundlerConfig;
use crate::drift::DriftConfig;
use crate::mirror::MirrorConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::planner::PlannerConfig;
use crate::preflight::PreflightConfig;
use crate::CoreError;
use depkeep_registry::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Pipeline settings, one table per component.
///
/// Every field has a default, so an empty file is a valid config. Values are
/// handed to components at construction; nothing reads them globally.
///
/// ```toml
/// [registry]
/// url = "https://registry.example.com"
///
/// [planner]
/// advisory_bonus = 5000
///
/// [orchestrator]
/// commit_policy = "incremental"
/// deadline_secs = 600
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryConfig>,
    pub drift: DriftConfig,
    pub planner: PlannerConfig,
    pub orchestrator: OrchestratorConfig,
    pub preflight: PreflightConfig,
    pub bundler: BundlerConfig,
    pub mirror: MirrorConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, CoreError> {
        toml::from_str(input).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!("loaded pipeline config from {}", path.display());
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, CoreError> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::CommitPolicy;

    #[test]
    fn empty_config_uses_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.planner.advisory_bonus, 10_000);
        assert_eq!(config.mirror.retention, 2);
        assert_eq!(config.orchestrator.commit_policy, CommitPolicy::AllOrNothing);
    }

    #[test]
    fn partial_tables_override_fields() {
        let config = PipelineConfig::from_toml_str(
            r#"
[registry]
url = "https://registry.example.com"

[drift]
workers = 2

[orchestrator]
commit_policy = "incremental"
deadline_secs = 600
"#,
        )
        .unwrap();
        assert_eq!(config.registry.unwrap().url, "https://registry.example.com");
        assert_eq!(config.drift.workers, 2);
        assert!(!config.drift.include_prereleases);
        assert_eq!(config.orchestrator.commit_policy, CommitPolicy::Incremental);
        assert_eq!(config.orchestrator.deadline_secs, Some(600));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = PipelineConfig::from_toml_str("[planner]\nmajor_wieght = 1\n").unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn roundtrips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depkeep-config.toml");
        let mut config = PipelineConfig::default();
        config.preflight.require_all_signed = true;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }
}
