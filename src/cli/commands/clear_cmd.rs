//! clear command - reset or delete capsule save files

use anyhow::Result;

use crate::core::types::CapsuleId;
use crate::inspect;
use crate::storage::{Encoding, StoragePaths};

/// Clear the named capsules, or all of them when none are named.
pub fn clear(
    paths: &StoragePaths,
    encoding: Encoding,
    capsules: &[String],
    remove_files: bool,
) -> Result<()> {
    let capsule_ids = capsules
        .iter()
        .map(|c| CapsuleId::new(c.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    inspect::clear(paths, encoding, &capsule_ids, remove_files)?;
    let action = if remove_files { "removed" } else { "cleared" };
    if capsule_ids.is_empty() {
        println!("{action} all capsules under {}", paths.root().display());
    } else {
        for capsule in &capsule_ids {
            println!("{action} {capsule}");
        }
    }
    Ok(())
}
