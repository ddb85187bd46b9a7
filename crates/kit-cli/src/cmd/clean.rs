//! Clean command

use anyhow::{Context as _, Result};

use crate::Context;

/// Remove interrupted downloads from the cache.
pub fn clean(ctx: &Context) -> Result<()> {
    let report = ctx.cache.clean().context("Failed to clean cache")?;
    println!(
        "Removed {} interrupted download{}.",
        report.staging_removed,
        if report.staging_removed == 1 { "" } else { "s" },
    );
    Ok(())
}
