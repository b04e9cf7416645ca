use super::{core_error, json_pretty, spin_fail, spin_ok, spinner, Context, EXIT_FAILURE, EXIT_SUCCESS};
use depkeep_core::{Bundler, PolicyContext, PreflightValidator};
use depkeep_store::{ArtifactStore, StoreLayout};
use std::path::Path;

pub fn run(ctx: &Context, out: &Path, cache: &Path) -> Result<u8, String> {
    let manifest = ctx.load_manifest()?;
    let registry = ctx.open_registry()?;
    let advisories = ctx.advisory_feed()?;
    let gate = ctx.policy_gate()?;
    let context = PolicyContext::survey(&manifest, &*registry, &*advisories, &ctx.config.drift)
        .map_err(|e| core_error(&e))?;
    let result = PreflightValidator::new(&*gate, ctx.config.preflight.clone())
        .validate(&manifest, &context)
        .map_err(|e| core_error(&e))?;
    if !result.passed {
        if ctx.json {
            println!("{}", json_pretty(&result)?);
        } else {
            eprintln!("preflight failed, refusing to bundle:");
            for v in &result.violations {
                eprintln!("  {}: {}", v.code, v.message);
            }
        }
        return Ok(EXIT_FAILURE);
    }

    let store = ArtifactStore::new(StoreLayout::new(cache));
    let pb = spinner(&format!("bundling {} dependencies...", manifest.len()), ctx.json);
    let index = match Bundler::new(&*registry, &store, ctx.config.bundler.clone()).bundle(&manifest, &result, out) {
        Ok(index) => index,
        Err(e) => {
            spin_fail(&pb, "bundle failed");
            return Err(core_error(&e));
        }
    };
    spin_ok(
        &pb,
        &format!("{} artifact(s) written to {}", index.entries.len(), out.display()),
    );

    if ctx.json {
        println!("{}", json_pretty(&index)?);
    } else {
        println!("bundle checksum: {}", index.checksum);
    }
    Ok(EXIT_SUCCESS)
}
