//! cli::args
//!
//! Command-line argument definitions using clap derive.
//!
//! # Global Flags
//!
//! These flags are available on all commands:
//! - `--help` / `-h`: Show help
//! - `--version`: Show version
//! - `--root <path>`: Operate on an explicit save root
//! - `--app <name>`: Locate the save root under the platform data dir
//! - `--encoding <none|base64>`: Transport encoding of the save files
//! - `--debug`: Enable debug logging

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::storage::{Encoding, StorageError, StoragePaths};

/// Keepsake - inspect and maintain object-graph save files
#[derive(Parser, Debug)]
#[command(name = "keepsake")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Save root directory (overrides --app)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Application name used to locate the save root
    #[arg(long, global = true, default_value = "keepsake")]
    pub app: String,

    /// Transport encoding of the save files
    #[arg(long, global = true, value_enum, default_value = "none")]
    pub encoding: Encoding,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Parser::parse()
    }

    /// Resolve the save root from `--root` or `--app`.
    ///
    /// # Errors
    ///
    /// `StorageError::NoDataDir` when neither an explicit root nor a
    /// platform data directory is available.
    pub fn paths(&self) -> Result<StoragePaths, StorageError> {
        match &self.root {
            Some(root) => Ok(StoragePaths::new(root)),
            None => StoragePaths::for_app(&self.app),
        }
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List capsule save files under the save root
    List,

    /// Check every save file for corruption, unreadable values, and
    /// dangling references
    Validate,

    /// Print one capsule's stored values and references
    Show {
        /// Capsule to describe
        capsule: String,
    },

    /// Reset capsules to empty (or delete their files entirely)
    Clear {
        /// Capsules to clear; all of them when omitted
        capsules: Vec<String>,

        /// Delete the save files instead of rewriting them empty
        #[arg(long)]
        remove_files: bool,
    },

    /// Generate shell completion scripts
    ///
    /// Add to your shell config:
    ///
    /// # Bash (~/.bashrc)
    /// eval "$(keepsake completion bash)"
    ///
    /// # Zsh (~/.zshrc)
    /// eval "$(keepsake completion zsh)"
    ///
    /// # Fish (~/.config/fish/config.fish)
    /// keepsake completion fish | source
    ///
    /// # PowerShell
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Supported shells for completion
#[derive(clap::ValueEnum, Debug, Clone, Copy)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}
