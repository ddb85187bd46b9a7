//! kit - hermetic tool manager
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
//!
//! Resolves package selectors against manifest sources, installs the
//! resulting artifacts into isolated roots and reports the environment each
//! package needs.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.kit/
//! ├── config.toml  # Optional user configuration
//! ├── manifests/   # User manifests (highest priority source)
//! ├── cache/       # Downloaded artifacts, keyed by checksum or URL
//! ├── pkg/         # One root per installed reference
//! ├── locks/       # Per-reference install locks
//! └── state.db     # SQLite record of installed packages
//! ```

pub mod cmd;
pub mod context;
pub mod ui;

use anyhow::Result;
use clap::{Parser, Subcommand};

pub use context::Context;

#[derive(Debug, Parser)]
#[command(name = "kit")]
#[command(author, version, about = "kit - hermetic tool manager")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit machine-readable JSON where supported
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Describe packages: name@channel, name-1.2.3, name, or a glob like 'go-1.2*'
    Info {
        #[arg(required = true)]
        selectors: Vec<String>,
    },
    /// Install packages concurrently
    Install {
        #[arg(required = true)]
        selectors: Vec<String>,
        /// Give up on each package after this many seconds
        #[arg(long, env = "KIT_TIMEOUT")]
        timeout: Option<u64>,
    },
    /// Remove installed packages
    Uninstall {
        #[arg(required = true)]
        selectors: Vec<String>,
    },
    /// List installed packages
    List,
    /// Compare the state database with the package directory
    Doctor {
        /// Delete records whose package root has disappeared
        #[arg(long)]
        prune: bool,
    },
    /// Remove interrupted downloads from the cache
    Clean,
    /// Print shell exports for the combined environment of packages
    Env {
        #[arg(required = true)]
        selectors: Vec<String>,
    },
}

/// Run a parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    let ctx = Context::load(cli.quiet)?;
    match cli.command {
        Commands::Info { selectors } => cmd::info::info(&ctx, &selectors, cli.json).await,
        Commands::Install { selectors, timeout } => {
            cmd::install::install(&ctx, &selectors, timeout).await
        }
        Commands::Uninstall { selectors } => cmd::uninstall::uninstall(&ctx, &selectors).await,
        Commands::List => cmd::list::list(&ctx, cli.json).await,
        Commands::Doctor { prune } => cmd::doctor::doctor(&ctx, prune).await,
        Commands::Clean => cmd::clean::clean(&ctx),
        Commands::Env { selectors } => cmd::env::env(&ctx, &selectors).await,
    }
}
