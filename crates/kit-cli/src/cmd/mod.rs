//! Command implementations

pub mod clean;
pub mod doctor;
pub mod env;
pub mod info;
pub mod install;
pub mod list;
pub mod uninstall;

use anyhow::{Context, Result};
use kit_schema::Selector;

/// Parse every argument, failing on the first invalid one.
pub(crate) fn parse_selectors(args: &[String]) -> Result<Vec<Selector>> {
    args.iter()
        .map(|arg| Selector::parse(arg).with_context(|| format!("Invalid selector '{arg}'")))
        .collect()
}
