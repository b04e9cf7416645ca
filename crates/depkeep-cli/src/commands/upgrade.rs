use super::{core_error, json_pretty, spin_fail, spin_ok, spinner, Context, EXIT_FAILURE, EXIT_SUCCESS};
use depkeep_core::{CancelToken, CommitPolicy, DriftDetector, Orchestrator, Plan, PreflightValidator};
use std::path::Path;

pub fn run(
    ctx: &Context,
    plan_path: &Path,
    incremental: bool,
    deadline_secs: Option<u64>,
) -> Result<u8, String> {
    let plan = Plan::load(plan_path)
        .map_err(|e| format!("failed to read plan {}: {e}", plan_path.display()))?;
    let manifest = ctx.load_manifest()?;
    let registry = ctx.open_registry()?;
    let advisories = ctx.advisory_feed()?;
    let signatures = ctx.signature_index()?;
    let gate = ctx.policy_gate()?;

    let mut config = ctx.config.orchestrator.clone();
    if incremental {
        config.commit_policy = CommitPolicy::Incremental;
    }
    if deadline_secs.is_some() {
        config.deadline_secs = deadline_secs;
    }

    let cancel = CancelToken::new();
    cancel.install_signal_handler();

    // The policy gate sees drift as it stood before the upgrade.
    let drift = DriftDetector::new(&*registry, &*advisories, ctx.config.drift.clone())
        .scan(&manifest)
        .map_err(|e| core_error(&e))?;

    let preflight = PreflightValidator::new(&*gate, ctx.config.preflight.clone());
    let orchestrator =
        Orchestrator::new(&*registry, &preflight, &*signatures, config, cancel).with_drift(drift);

    let pb = spinner(&format!("applying {} upgrade step(s)...", plan.len()), ctx.json);
    let outcome = match orchestrator.execute(&ctx.manifest_file(), &plan) {
        Ok(outcome) => outcome,
        Err(e) => {
            spin_fail(&pb, "upgrade aborted");
            return Err(core_error(&e));
        }
    };
    if outcome.is_committed() {
        spin_ok(&pb, &format!("committed {} step(s)", outcome.applied.len()));
    } else {
        spin_fail(&pb, &format!("rolled back ({})", outcome.final_state));
    }

    if ctx.json {
        println!("{}", json_pretty(&outcome)?);
    } else {
        for step in &outcome.applied {
            println!("  {} {} -> {}", step.name, step.from, step.to);
        }
        if let Some(failure) = &outcome.failure {
            println!(
                "step {} ({}) failed while {}: {}",
                failure.index + 1,
                failure.dependency,
                failure.state,
                failure.reason.describe()
            );
        }
    }

    if outcome.is_committed() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_FAILURE)
    }
}
