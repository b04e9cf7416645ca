use super::{
    core_error, json_pretty, spin_fail, spin_ok, spinner, Context, EXIT_FAILURE, EXIT_INTEGRITY_ERROR,
    EXIT_SUCCESS,
};
use depkeep_core::{verify_mirror, CancelToken, MirrorManager};
use depkeep_store::{ArtifactStore, StoreLayout};
use std::path::Path;

pub fn sync(ctx: &Context, dir: &Path) -> Result<u8, String> {
    let manifest = ctx.load_manifest()?;
    let registry = ctx.open_registry()?;
    let store = ArtifactStore::new(StoreLayout::new(dir));
    let cancel = CancelToken::new();
    cancel.install_signal_handler();

    let pb = spinner(&format!("syncing mirror at {}...", dir.display()), ctx.json);
    let mirror = MirrorManager::new(&*registry, &store, ctx.config.mirror.clone()).with_cancel(cancel);
    let report = match mirror.sync(&manifest) {
        Ok(report) => report,
        Err(e) => {
            spin_fail(&pb, "mirror sync failed");
            return Err(core_error(&e));
        }
    };
    let summary = format!(
        "{} fetched, {} already present, {} failed, {} pruned",
        report.fetched.len(),
        report.present,
        report.failed.len(),
        report.pruned.len()
    );
    if report.is_complete() {
        spin_ok(&pb, &summary);
    } else {
        spin_fail(&pb, &summary);
    }

    if ctx.json {
        println!("{}", json_pretty(&report)?);
    } else {
        for f in &report.failed {
            println!("  FAIL {}: {}", f.key, f.reason);
        }
    }

    if report.is_complete() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_FAILURE)
    }
}

pub fn verify(ctx: &Context, dir: &Path) -> Result<u8, String> {
    let manifest = ctx.load_manifest()?;
    let store = ArtifactStore::new(StoreLayout::new(dir));
    let report = verify_mirror(&store, &manifest).map_err(|e| core_error(&e))?;

    if ctx.json {
        let payload = serde_json::json!({
            "checked": report.checked,
            "passed": report.passed,
            "missing": report.missing,
            "failed": report.failed.iter().map(|f| serde_json::json!({
                "artifact": f.key,
                "reason": f.reason,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "mirror integrity: {}/{} artifacts passed, {} missing",
            report.passed,
            report.checked,
            report.missing.len()
        );
        for f in &report.failed {
            println!("  FAIL {}: {}", f.key, f.reason);
        }
    }

    if report.is_clean() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_INTEGRITY_ERROR)
    }
}
