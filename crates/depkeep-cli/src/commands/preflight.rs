use super::{core_error, json_pretty, Context, EXIT_FAILURE, EXIT_SUCCESS};
use depkeep_core::{PolicyContext, PreflightValidator};

pub fn run(ctx: &Context) -> Result<u8, String> {
    let manifest = ctx.load_manifest()?;
    let gate = ctx.policy_gate()?;
    let context = match ctx.open_registry() {
        Ok(registry) => {
            let advisories = ctx.advisory_feed()?;
            PolicyContext::survey(&manifest, &*registry, &*advisories, &ctx.config.drift)
                .map_err(|e| core_error(&e))?
        }
        Err(e) => {
            tracing::warn!("no registry, policy gate sees no drift or conflicts: {e}");
            PolicyContext::for_manifest(&manifest)
        }
    };
    let validator = PreflightValidator::new(&*gate, ctx.config.preflight.clone());
    let result = validator
        .validate(&manifest, &context)
        .map_err(|e| core_error(&e))?;

    if ctx.json {
        println!("{}", json_pretty(&result)?);
    } else {
        for v in &result.violations {
            match &v.dependency {
                Some(dep) => println!("  {} {dep}: {}", v.code, v.message),
                None => println!("  {}: {}", v.code, v.message),
            }
        }
        let verdict = if result.passed { "passed" } else { "failed" };
        println!(
            "preflight {verdict}: {} violation(s), hashes complete: {}, signatures present: {}",
            result.violations.len(),
            result.hashes_complete,
            result.signatures_present
        );
    }

    if result.passed {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_FAILURE)
    }
}
