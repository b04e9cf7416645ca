use super::{colorize_severity, core_error, json_pretty, spin_fail, spin_ok, spinner, Context, EXIT_SUCCESS};
use depkeep_core::DriftDetector;

pub fn run(ctx: &Context) -> Result<u8, String> {
    let manifest = ctx.load_manifest()?;
    let registry = ctx.open_registry()?;
    let advisories = ctx.advisory_feed()?;

    let pb = spinner(&format!("checking {} pinned dependencies...", manifest.len()), ctx.json);
    let report = match DriftDetector::new(&*registry, &*advisories, ctx.config.drift.clone()).scan(&manifest) {
        Ok(report) => {
            spin_ok(&pb, &format!("checked {} dependencies", report.records.len()));
            report
        }
        Err(e) => {
            spin_fail(&pb, "drift scan failed");
            return Err(core_error(&e));
        }
    };

    if ctx.json {
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }

    for record in &report.records {
        let latest = record
            .latest
            .as_ref()
            .map_or_else(|| "?".to_owned(), ToString::to_string);
        let mut line = format!(
            "  {:<24} {:<12} -> {:<12} {}",
            record.name.as_str(),
            record.pinned.to_string(),
            latest,
            colorize_severity(record.severity.as_str())
        );
        if record.advisory {
            line.push_str(" [advisory]");
        }
        if let Some(err) = &record.lookup_error {
            line.push_str(&format!(" (lookup failed: {err})"));
        }
        println!("{line}");
    }
    let drifted = report.drifted().count();
    println!(
        "drift: {drifted} of {} dependencies behind, {} lookup failure(s)",
        report.records.len(),
        report.lookup_failures()
    );
    Ok(EXIT_SUCCESS)
}
