//! Uninstall command

use anyhow::{Context as _, Result, bail};

use crate::Context;
use crate::cmd::parse_selectors;

/// Remove every installed package matching each selector.
pub async fn uninstall(ctx: &Context, args: &[String]) -> Result<()> {
    let selectors = parse_selectors(args)?;
    let installed = ctx
        .state
        .list_all()
        .await
        .context("Failed to read state database")?;

    let mut failed = 0;
    for selector in &selectors {
        let matches: Vec<_> = installed
            .iter()
            .filter(|r| selector.matches(&r.reference))
            .collect();
        if matches.is_empty() {
            eprintln!("error: nothing installed matches '{selector}'");
            failed += 1;
            continue;
        }
        for record in matches {
            match ctx.installer.uninstall(&record.reference).await {
                Ok(_) => println!("Removed {}", record.reference),
                Err(e) => {
                    eprintln!("error: {}: {:#}", record.reference, anyhow::Error::from(e));
                    failed += 1;
                }
            }
        }
    }

    if failed > 0 {
        bail!("{failed} removal{} failed", if failed == 1 { "" } else { "s" });
    }
    Ok(())
}
