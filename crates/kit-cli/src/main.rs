//! kit - hermetic tool manager

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use kit_cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // -v wins over RUST_LOG; otherwise only warnings and errors.
    let filter = if cli.verbose {
        EnvFilter::new("kit_core=debug,kit_cli=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    kit_cli::run(cli).await
}
