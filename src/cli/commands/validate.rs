//! validate command - check save files for problems

use anyhow::{bail, Result};

use crate::inspect::{self, Severity};
use crate::registry::SaveableRegistry;
use crate::storage::{Encoding, StoragePaths};

/// Validate every save file and report the findings.
///
/// Exits non-zero when any finding is an error. Type-registration
/// warnings are expected here: the CLI has no registered types, so only
/// structural problems can escalate.
pub fn validate(paths: &StoragePaths, encoding: Encoding) -> Result<()> {
    let report = inspect::validate(paths, encoding, &SaveableRegistry::new())?;

    if report.is_clean() {
        println!("no problems found under {}", paths.root().display());
        return Ok(());
    }
    for finding in &report.findings {
        println!("{finding}");
    }
    if report.worst() == Severity::Error {
        bail!("validation found errors");
    }
    Ok(())
}
