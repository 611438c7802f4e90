//! list command - enumerate capsule save files

use anyhow::Result;

use crate::inspect;
use crate::storage::StoragePaths;

/// Print the capsules found under the save root.
pub fn list(paths: &StoragePaths) -> Result<()> {
    let capsules = inspect::list_capsules(paths)?;
    if capsules.is_empty() {
        println!("no capsules under {}", paths.root().display());
        return Ok(());
    }
    for capsule in capsules {
        println!("{capsule}");
    }
    Ok(())
}
