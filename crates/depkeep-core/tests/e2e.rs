//! End-to-end runs of the whole pipeline against an on-disk index snapshot:
//! drift, advice, planning, orchestration, preflight, mirroring, and
//! bundling, in the order the CLI drives them.

use depkeep_core::bundler::sibling_index_path;
use depkeep_core::{
    verify_bundle, Advisor, AllowAll, Bundler, CancelToken, DenyList, DriftDetector, MirrorManager,
    Orchestrator, PipelineConfig, Planner, PolicyContext, PreflightValidator, StaticAdvisories,
    StaticSignatures, ViolationCode,
};
use depkeep_registry::{IndexRegistry, RegistryClient, VersionInfo};
use depkeep_schema::{Constraint, Manifest, ManifestFile, PinnedEntry, Platform, Version};
use depkeep_store::{ArtifactStore, StoreLayout};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

fn v(s: &str) -> Version {
    depkeep_schema::parse_version(s).unwrap()
}

const PLATFORMS: [&str; 2] = ["linux-x86_64", "macos-arm64"];

/// Export an index snapshot with two platforms per version.
fn export_snapshot(root: &Path) {
    let mut registry = IndexRegistry::new("snapshot");
    let catalog: &[(&str, &[&str])] = &[
        ("requests", &["2.30.0", "2.31.0", "2.32.3"][..]),
        ("urllib3", &["1.26.18", "1.26.20", "2.2.1"][..]),
        ("certifi", &["2024.2.2", "2024.7.4"][..]),
    ];
    for (name, versions) in catalog {
        for version in *versions {
            let mut info = VersionInfo::new(v(version));
            if *name == "requests" {
                info = info.depends_on("urllib3", Constraint::parse(">=1.21.1, <3").unwrap());
            }
            registry.publish(name, info);
            for platform in PLATFORMS {
                registry.add_artifact(
                    name,
                    &v(version),
                    platform,
                    format!("{name} {version} {platform}").into_bytes(),
                );
            }
        }
    }
    registry.save_dir(root).unwrap();
}

fn initial_manifest(registry: &IndexRegistry) -> Manifest {
    let mut manifest = Manifest::new(
        "webapp",
        PLATFORMS.iter().map(|p| Platform::new(*p)).collect(),
    );
    for (name, version, deps) in [
        ("requests", "2.30.0", Some(("urllib3", ">=1.21.1, <3"))),
        ("urllib3", "1.26.18", None),
        ("certifi", "2024.2.2", None),
    ] {
        let hashes = PLATFORMS
            .iter()
            .map(|p| {
                (
                    Platform::new(*p),
                    registry.fetch_artifact_hash(name, &v(version), p).unwrap(),
                )
            })
            .collect();
        let mut dependencies = BTreeMap::new();
        if let Some((dep, range)) = deps {
            dependencies.insert(dep.into(), Constraint::parse(range).unwrap());
        }
        manifest.entries.push(PinnedEntry {
            name: name.into(),
            version: v(version),
            provenance: "snapshot".to_owned(),
            signature: None,
            hashes,
            dependencies,
        });
    }
    // The project itself stays on urllib3 1.x.
    manifest.requirements.push(depkeep_schema::Requirement {
        name: "urllib3".into(),
        constraint: Constraint::parse("<2").unwrap(),
        signed: false,
        extras: Default::default(),
    });
    manifest
}

#[test]
fn e2e_offline_upgrade_and_bundle() {
    let work = tempfile::tempdir().unwrap();
    let snapshot = work.path().join("snapshot");
    export_snapshot(&snapshot);
    let registry = IndexRegistry::load_dir(&snapshot).unwrap();
    let config = PipelineConfig::from_toml_str("[drift]\nworkers = 2\n").unwrap();

    let file = ManifestFile::new(work.path().join("depkeep.toml"));
    file.commit(&initial_manifest(&registry)).unwrap();
    let manifest = file.load().unwrap();

    let advisories = StaticAdvisories::new().with(
        "certifi",
        "PYSEC-2024-230",
        Constraint::parse("<2024.7.4").unwrap(),
    );
    let drift = DriftDetector::new(&registry, &advisories, config.drift.clone())
        .scan(&manifest)
        .unwrap();
    assert_eq!(drift.records.len(), 3);
    assert!(drift.record("certifi").unwrap().advisory);

    let proposal = Advisor::new(&registry, config.drift.clone())
        .propose(&drift, &manifest)
        .unwrap();
    let plan = Planner::new(config.planner.clone()).plan(&proposal.candidates);
    let names: Vec<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
    // The advisory fix goes first. urllib3 ranks by its major drift to 2.x
    // even though the project holds the step below 2.
    assert_eq!(names, vec!["certifi", "urllib3", "requests"]);
    assert_eq!(plan.steps[1].to, v("1.26.20"));

    let signatures = StaticSignatures::new().with("requests", &v("2.32.3"), "sigstore:requests-2.32.3");
    let preflight = PreflightValidator::new(&AllowAll, config.preflight.clone());
    let outcome = Orchestrator::new(
        &registry,
        &preflight,
        &signatures,
        config.orchestrator.clone(),
        CancelToken::new(),
    )
    .execute(&file, &plan)
    .unwrap();
    assert!(outcome.is_committed(), "{:?}", outcome.failure);

    let committed = file.load().unwrap();
    assert_eq!(committed.entry("requests").unwrap().version, v("2.32.3"));
    assert_eq!(
        committed.entry("requests").unwrap().signature.as_deref(),
        Some("sigstore:requests-2.32.3")
    );
    assert_eq!(committed.entry("urllib3").unwrap().version, v("1.26.20"));
    assert_eq!(committed.entry("requests").unwrap().provenance, "snapshot");

    let result = preflight
        .validate(&committed, &PolicyContext::for_manifest(&committed).with_drift(&drift))
        .unwrap();
    assert!(result.passed);

    let mirror_store = ArtifactStore::new(StoreLayout::new(work.path().join("mirror")));
    let sync = MirrorManager::new(&registry, &mirror_store, config.mirror.clone())
        .sync(&committed)
        .unwrap();
    assert_eq!(sync.fetched.len(), 6);
    assert!(sync.is_complete());

    let out = work.path().join("dist/webapp-wheelhouse.tar");
    let index = Bundler::new(&registry, &mirror_store, config.bundler.clone())
        .bundle(&committed, &result, &out)
        .unwrap();
    assert_eq!(index.entries.len(), 6);
    assert!(verify_bundle(&out).unwrap().is_valid());
    let written: depkeep_core::BundleManifest =
        serde_json::from_slice(&fs::read(sibling_index_path(&out)).unwrap()).unwrap();
    assert_eq!(written, index);
}

#[test]
fn e2e_policy_gate_blocks_bundle() {
    let work = tempfile::tempdir().unwrap();
    let snapshot = work.path().join("snapshot");
    export_snapshot(&snapshot);
    let registry = IndexRegistry::load_dir(&snapshot).unwrap();
    let manifest = initial_manifest(&registry);

    let gate = DenyList::default().deny(
        "certifi",
        Constraint::parse("<2024.7.4").unwrap(),
        "revoked root certificates",
    );
    let preflight = PreflightValidator::new(&gate, PipelineConfig::default().preflight);
    let result = preflight
        .validate(&manifest, &PolicyContext::for_manifest(&manifest))
        .unwrap();
    assert_eq!(result.codes(), vec![ViolationCode::PolicyViolation]);

    let cache = ArtifactStore::new(StoreLayout::new(work.path().join("cache")));
    let out = work.path().join("blocked.tar");
    let err = Bundler::new(&registry, &cache, PipelineConfig::default().bundler)
        .bundle(&manifest, &result, &out)
        .unwrap_err();
    assert!(matches!(err, depkeep_core::CoreError::PreflightNotPassed(1)));
    assert!(!out.exists());
}
