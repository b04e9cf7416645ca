use super::{core_error, json_pretty, spin_fail, spin_ok, spinner, Context, EXIT_SUCCESS};
use depkeep_core::{Advisor, DriftDetector, Planner, SkipReason};
use std::path::Path;

pub fn run(ctx: &Context, out: &Path) -> Result<u8, String> {
    let manifest = ctx.load_manifest()?;
    let registry = ctx.open_registry()?;
    let advisories = ctx.advisory_feed()?;

    let pb = spinner("computing upgrade plan...", ctx.json);
    let proposal = DriftDetector::new(&*registry, &*advisories, ctx.config.drift.clone())
        .scan(&manifest)
        .and_then(|drift| Advisor::new(&*registry, ctx.config.drift.clone()).propose(&drift, &manifest));
    let proposal = match proposal {
        Ok(proposal) => proposal,
        Err(e) => {
            spin_fail(&pb, "planning failed");
            return Err(core_error(&e));
        }
    };
    let plan = Planner::new(ctx.config.planner.clone()).plan(&proposal.candidates);
    plan.save(out).map_err(|e| core_error(&e))?;
    spin_ok(&pb, &format!("{} step(s) written to {}", plan.len(), out.display()));

    if ctx.json {
        let payload = serde_json::json!({
            "plan": plan,
            "skipped": proposal.skipped,
            "path": out,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    for (i, step) in plan.steps.iter().enumerate() {
        println!(
            "  {}. {} {} -> {} (score {}: {})",
            i + 1,
            step.name,
            step.from,
            step.to,
            step.score,
            step.rationale
        );
    }
    for skipped in &proposal.skipped {
        match &skipped.reason {
            SkipReason::Conflict(report) => println!("  skipped {}", report.describe()),
            SkipReason::Registry(msg) => println!("  skipped {}: {msg}", skipped.name),
            SkipReason::NoCandidate => {
                println!("  skipped {}: no compatible newer version", skipped.name);
            }
        }
    }
    if plan.is_empty() {
        println!("nothing to upgrade");
    }
    Ok(EXIT_SUCCESS)
}
