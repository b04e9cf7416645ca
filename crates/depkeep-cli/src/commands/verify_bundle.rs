use super::{core_error, json_pretty, EXIT_INTEGRITY_ERROR, EXIT_SUCCESS};
use depkeep_core::verify_bundle;
use std::path::Path;

pub fn run(bundle: &Path, json: bool) -> Result<u8, String> {
    let report = verify_bundle(bundle).map_err(|e| core_error(&e))?;

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        println!(
            "bundle {}: {} entries checked, checksum {}",
            bundle.display(),
            report.entries_checked,
            if report.checksum_ok { "ok" } else { "MISMATCH" }
        );
        for f in &report.failures {
            println!("  FAIL {f}");
        }
    }

    if report.is_valid() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_INTEGRITY_ERROR)
    }
}
