//! cli::commands
//!
//! Command dispatch and handlers.
//!
//! # Architecture
//!
//! Each command handler:
//! 1. Validates command-specific arguments
//! 2. Calls into [`crate::inspect`] to do the work
//! 3. Formats and displays output
//!
//! Handlers operate on save files directly; none of them needs live
//! capsule objects or a populated type registry.

mod clear_cmd;
mod completion;
mod list;
mod show;
mod validate;

pub use clear_cmd::clear;
pub use completion::completion;
pub use list::list;
pub use show::show;
pub use validate::validate;

use anyhow::Result;

use super::args::{Cli, Command};

/// Dispatch a parsed command to its handler.
pub fn dispatch(cli: Cli) -> Result<()> {
    if let Command::Completion { shell } = cli.command {
        return completion(shell);
    }

    let paths = cli.paths()?;
    match cli.command {
        Command::List => list(&paths),
        Command::Validate => validate(&paths, cli.encoding),
        Command::Show { capsule } => show(&paths, cli.encoding, &capsule),
        Command::Clear {
            capsules,
            remove_files,
        } => clear(&paths, cli.encoding, &capsules, remove_files),
        Command::Completion { .. } => unreachable!("handled above"),
    }
}
