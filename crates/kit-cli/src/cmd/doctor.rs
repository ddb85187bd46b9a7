//! Doctor command

use anyhow::{Context as _, Result};

use crate::Context;

/// Report disagreements between the state database and the package directory.
pub async fn doctor(ctx: &Context, prune: bool) -> Result<()> {
    let report = ctx
        .state
        .reconcile(&ctx.paths.pkg_path())
        .await
        .context("Failed to reconcile state")?;

    if report.is_clean() {
        println!("No problems found.");
        return Ok(());
    }

    for problem in report.inconsistencies() {
        println!("  {problem}");
    }
    for path in &report.untracked {
        println!("  Untracked directory: {}", path.display());
    }

    if prune {
        for reference in ctx.state.prune_orphans().await? {
            println!("  Pruned {reference}");
        }
    } else if !report.orphaned.is_empty() {
        println!();
        println!("Run 'kit doctor --prune' to drop orphaned records.");
    }
    Ok(())
}
