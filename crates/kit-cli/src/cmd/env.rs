//! Env command

use anyhow::{Context as _, Result};
use kit_core::envars::{self, Envars};

use crate::Context;
use crate::cmd::parse_selectors;
use crate::ui::shell_quote;

/// Print `export` lines for the packages' combined environment.
///
/// Packages apply in argument order, each on top of the previous result, so
/// later path prepends take precedence.
pub async fn env(ctx: &Context, args: &[String]) -> Result<()> {
    let selectors = parse_selectors(args)?;
    let installed = ctx
        .state
        .list_all()
        .await
        .context("Failed to read state database")?;

    let mut current = Envars::from_os();
    let mut touched: Vec<String> = Vec::new();
    for selector in &selectors {
        let pkg = ctx.resolver.resolve(selector, &installed).await?;
        let mapping = envars::apply(&pkg.root, &pkg.env, &current);
        for (key, _) in mapping.changed(false) {
            if !touched.contains(&key) {
                touched.push(key);
            }
        }
        let mut next = Envars::new();
        for (key, value) in mapping.iter() {
            next.set(key, value);
        }
        current = next;
    }

    for key in &touched {
        if let Some(value) = current.get(key) {
            println!("export {key}={}", shell_quote(value));
        }
    }
    Ok(())
}
