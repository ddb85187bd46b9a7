//! Info command

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use futures::future::try_join_all;
use kit_core::resolver::{PackageState, ResolvedPackage};
use kit_schema::Target;

use crate::Context;
use crate::cmd::parse_selectors;
use crate::ui::{heading, shell_quote};

const LABEL_WIDTH: usize = 13;

/// Resolve each selector and describe the result.
pub async fn info(ctx: &Context, args: &[String], json: bool) -> Result<()> {
    let selectors = parse_selectors(args)?;
    let installed = ctx
        .state
        .list_all()
        .await
        .context("Failed to read state database")?;
    let timeout = ctx.timeout(None);

    let packages = try_join_all(selectors.iter().map(|selector| {
        let installed = &installed;
        async move {
            let pkg = match timeout {
                Some(t) => ctx.resolver.resolve_with_timeout(selector, installed, t).await,
                None => ctx.resolver.resolve(selector, installed).await,
            }?;
            anyhow::Ok(pkg)
        }
    }))
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&packages)?);
        return Ok(());
    }

    for (i, pkg) in packages.iter().enumerate() {
        if i > 0 {
            println!();
        }
        print_package(pkg);
    }
    Ok(())
}

fn row(label: &str, value: impl std::fmt::Display) {
    println!("{}{value}", heading(&format!("{label:<LABEL_WIDTH$}")));
}

fn print_package(pkg: &ResolvedPackage) {
    row("Name:", &pkg.reference.name);
    match &pkg.reference.target {
        Target::Version(v) => row("Version:", v),
        Target::Channel(c) => row("Channel:", c),
    }
    if !pkg.description.is_empty() {
        row("Description:", &pkg.description);
    }
    if let Some(homepage) = &pkg.homepage {
        row("Homepage:", homepage);
    }
    row("State:", pkg.state);
    row("Source:", &pkg.source);
    row("Root:", pkg.root.display());
    if !pkg.requires.is_empty() {
        row("Requires:", pkg.requires.join(", "));
    }
    if !pkg.provides.is_empty() {
        row("Provides:", pkg.provides.join(", "));
    }

    let changed = pkg.environment.changed(false);
    if !changed.is_empty() {
        row("Envars:", "");
        for (key, value) in changed {
            println!("  {key}={}", shell_quote(&value));
        }
    }

    // Globs are only meaningful against an unpacked root.
    if pkg.state == PackageState::Installed {
        let binaries = pkg.resolve_binaries();
        if !binaries.is_empty() {
            row("Binaries:", binary_names(&binaries));
        }
    } else if !pkg.binaries.is_empty() {
        row("Binaries:", pkg.binaries.join(", "));
    }
}

/// File names only, space separated.
fn binary_names(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .filter_map(|p| p.file_name())
        .map(std::ffi::OsStr::to_string_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}
