pub mod bundle;
pub mod completions;
pub mod drift;
pub mod mirror;
pub mod plan;
pub mod preflight;
pub mod upgrade;
pub mod verify_bundle;

use depkeep_core::{
    AdvisoryFeed, AllowAll, CoreError, DenyList, NoAdvisories, NoSignatures, PipelineConfig,
    PolicyGate, SignatureIndex, StaticAdvisories, StaticSignatures,
};
use depkeep_registry::{HttpRegistry, IndexRegistry, RegistryClient, RegistryConfig};
use depkeep_schema::{Manifest, ManifestFile};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_INTEGRITY_ERROR: u8 = 3;

/// Everything a command needs besides its own arguments.
pub struct Context {
    pub manifest: PathBuf,
    pub registry: Option<String>,
    pub config: PipelineConfig,
    pub advisories: Option<PathBuf>,
    pub signatures: Option<PathBuf>,
    pub policy: Option<PathBuf>,
    pub json: bool,
}

impl Context {
    pub fn manifest_file(&self) -> ManifestFile {
        ManifestFile::new(&self.manifest)
    }

    pub fn load_manifest(&self) -> Result<Manifest, String> {
        self.manifest_file()
            .load()
            .map_err(|e| format!("manifest error: {e}"))
    }

    /// `--registry` wins over `[registry]` in the config, which wins over
    /// the user-level registry config. A value that is not an http(s) URL
    /// is read as an index snapshot directory.
    pub fn open_registry(&self) -> Result<Box<dyn RegistryClient>, String> {
        if let Some(target) = self.registry.as_deref() {
            if target.starts_with("http://") || target.starts_with("https://") {
                return Ok(Box::new(HttpRegistry::new(self.registry_config_for(target))));
            }
            let registry = IndexRegistry::load_dir(Path::new(target))
                .map_err(|e| format!("failed to open index snapshot {target}: {e}"))?;
            return Ok(Box::new(registry));
        }
        let config = match &self.config.registry {
            Some(config) => config.clone(),
            None => RegistryConfig::load_default()
                .map_err(|e| format!("no --registry and no registry config: {e}"))?,
        };
        Ok(Box::new(HttpRegistry::new(config)))
    }

    /// Config for a `--registry` URL: timeout and retry come from the
    /// `[registry]` table, the token only if that table names the same URL.
    fn registry_config_for(&self, url: &str) -> RegistryConfig {
        let mut config = RegistryConfig::new(url);
        if let Some(base) = &self.config.registry {
            config.timeout_secs = base.timeout_secs;
            config.retry = base.retry.clone();
            if base.url == config.url {
                config.auth_token.clone_from(&base.auth_token);
            }
        }
        config
    }

    pub fn advisory_feed(&self) -> Result<Box<dyn AdvisoryFeed>, String> {
        match &self.advisories {
            Some(path) => Ok(Box::new(StaticAdvisories::load(path).map_err(|e| {
                format!("failed to load advisories from {}: {e}", path.display())
            })?)),
            None => Ok(Box::new(NoAdvisories)),
        }
    }

    pub fn signature_index(&self) -> Result<Box<dyn SignatureIndex>, String> {
        match &self.signatures {
            Some(path) => Ok(Box::new(StaticSignatures::load(path).map_err(|e| {
                format!("failed to load signatures from {}: {e}", path.display())
            })?)),
            None => Ok(Box::new(NoSignatures)),
        }
    }

    pub fn policy_gate(&self) -> Result<Box<dyn PolicyGate>, String> {
        match &self.policy {
            Some(path) => Ok(Box::new(DenyList::load(path).map_err(|e| {
                format!("failed to load policy from {}: {e}", path.display())
            })?)),
            None => Ok(Box::new(AllowAll)),
        }
    }
}

/// Render a core error with a prefix `main` can map to an exit code.
pub fn core_error(e: &CoreError) -> String {
    if e.is_integrity() {
        format!("integrity error: {e}")
    } else {
        e.to_string()
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// A spinner on stderr, or a hidden bar when output is JSON.
pub fn spinner(msg: &str, json: bool) -> ProgressBar {
    if json {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_severity(severity: &str) -> String {
    use console::Style;
    match severity {
        "major" => Style::new().red().bold().apply_to(severity).to_string(),
        "minor" => Style::new().yellow().apply_to(severity).to_string(),
        "patch" => Style::new().cyan().apply_to(severity).to_string(),
        "none" => Style::new().dim().apply_to(severity).to_string(),
        other => other.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(dir: &Path) -> Context {
        Context {
            manifest: dir.join("depkeep.toml"),
            registry: None,
            config: PipelineConfig::default(),
            advisories: None,
            signatures: None,
            policy: None,
            json: false,
        }
    }

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_severity_keeps_text() {
        for severity in ["major", "minor", "patch", "none"] {
            assert!(colorize_severity(severity).contains(severity));
        }
        assert_eq!(colorize_severity("unknown"), "unknown");
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_MANIFEST_ERROR);
        assert_ne!(EXIT_MANIFEST_ERROR, EXIT_INTEGRITY_ERROR);
    }

    #[test]
    fn missing_manifest_is_a_manifest_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = context(dir.path()).load_manifest().unwrap_err();
        assert!(err.starts_with("manifest error:"), "{err}");
    }

    #[test]
    fn registry_url_opens_http_client() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.registry = Some("http://localhost:8080".to_owned());
        assert!(ctx.open_registry().is_ok());
    }

    #[test]
    fn registry_url_keeps_configured_timeout_and_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let mut base = RegistryConfig::new("https://registry.example.org").with_token("secret");
        base.timeout_secs = 7;
        base.retry.max_attempts = 5;
        ctx.config.registry = Some(base.clone());

        let other = ctx.registry_config_for("http://localhost:8080/");
        assert_eq!(other.url, "http://localhost:8080");
        assert_eq!(other.timeout_secs, 7);
        assert_eq!(other.retry, base.retry);
        assert!(other.auth_token.is_none());

        let same = ctx.registry_config_for("https://registry.example.org");
        assert_eq!(same.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn registry_url_without_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let config = ctx.registry_config_for("http://localhost:8080");
        assert_eq!(config, RegistryConfig::new("http://localhost:8080"));
    }

    #[test]
    fn registry_path_without_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.registry = Some(dir.path().join("nope").to_string_lossy().into_owned());
        let err = ctx.open_registry().err().unwrap();
        assert!(err.contains("index snapshot"), "{err}");
    }

    #[test]
    fn unset_collaborators_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        assert!(ctx.advisory_feed().is_ok());
        assert!(ctx.signature_index().is_ok());
        assert!(ctx.policy_gate().is_ok());
    }

    #[test]
    fn integrity_errors_get_a_mappable_prefix() {
        let err = CoreError::Integrity {
            artifact: "libA 1.0.0 any".to_owned(),
            expected: "sha256:aa".to_owned(),
            actual: "sha256:bb".to_owned(),
        };
        assert!(core_error(&err).starts_with("integrity error:"));
        assert!(!core_error(&CoreError::Config("x".into())).starts_with("integrity"));
    }

    #[test]
    fn hidden_spinner_in_json_mode() {
        let pb = spinner("testing...", true);
        assert!(pb.is_hidden());
        spin_ok(&pb, "done");
    }

    #[test]
    fn spinner_fail_creates_progress_bar() {
        let pb = spinner("testing...", false);
        spin_fail(&pb, "failed");
    }
}
