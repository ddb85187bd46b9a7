//! Install command

use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use futures::future::join_all;
use kit_core::state::InstalledRecord;
use kit_schema::Selector;
use tracing::info;

use crate::Context;
use crate::cmd::parse_selectors;

/// Install every selector concurrently. Failures are reported per package
/// and do not stop the others.
pub async fn install(ctx: &Context, args: &[String], timeout: Option<u64>) -> Result<()> {
    let selectors = parse_selectors(args)?;
    let timeout = ctx.timeout(timeout);
    let started = Instant::now();

    let results = join_all(
        selectors
            .iter()
            .map(|selector| install_one(ctx, selector, timeout)),
    )
    .await;

    let mut failed = 0;
    for (selector, result) in selectors.iter().zip(results) {
        match result {
            Ok(record) => println!("{} {}", record.reference, record.install_path.display()),
            Err(e) => {
                eprintln!("error: {selector}: {e:#}");
                failed += 1;
            }
        }
    }
    info!(elapsed = ?started.elapsed(), count = selectors.len(), "install finished");

    if failed > 0 {
        bail!(
            "{failed} of {} package{} failed to install",
            selectors.len(),
            if selectors.len() == 1 { "" } else { "s" }
        );
    }
    Ok(())
}

async fn install_one(
    ctx: &Context,
    selector: &Selector,
    timeout: Option<Duration>,
) -> Result<InstalledRecord> {
    if let Some(timeout) = timeout {
        return Ok(ctx.installer.ensure(&ctx.resolver, selector, timeout).await?);
    }
    let installed = ctx.state.list_all().await?;
    let pkg = ctx.resolver.resolve(selector, &installed).await?;
    Ok(ctx.installer.install(&pkg).await?)
}
