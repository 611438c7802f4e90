//! show command - print one capsule's stored content

use anyhow::Result;

use crate::core::types::CapsuleId;
use crate::inspect;
use crate::storage::{Encoding, StoragePaths};

/// Describe one capsule save file.
pub fn show(paths: &StoragePaths, encoding: Encoding, capsule: &str) -> Result<()> {
    let capsule_id = CapsuleId::new(capsule)?;
    let description = inspect::describe(paths, encoding, &capsule_id)?;
    print!("{description}");
    Ok(())
}
