//! cli
//!
//! Command-line interface layer for Keepsake.
//!
//! # Responsibilities
//!
//! - Parse command-line arguments and global flags
//! - Initialize logging
//! - Delegate to command handlers
//!
//! # Architecture
//!
//! The CLI layer is thin. It parses arguments via clap and dispatches to
//! [`crate::inspect`], which does the actual file work. Library users
//! embedding [`crate::storage::Storage`] never touch this module.

pub mod args;
pub mod commands;

pub use args::{Cli, Shell};

use anyhow::Result;

/// Run the CLI application.
///
/// This is the main entry point called from `main.rs`.
pub fn run() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.debug);
    commands::dispatch(cli)
}

/// Logging goes to stderr so command output stays pipeable. `RUST_LOG`
/// overrides the `--debug` flag.
fn init_logging(debug: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(if debug { "debug" } else { "warn" }));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
