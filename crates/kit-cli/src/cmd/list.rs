//! List command

use anyhow::{Context as _, Result};

use crate::Context;
use crate::ui::heading;

/// List every recorded package, flagging ones whose root is missing.
pub async fn list(ctx: &Context, json: bool) -> Result<()> {
    let records = ctx
        .state
        .list_all()
        .await
        .context("Failed to read state database")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No packages installed.");
        return Ok(());
    }

    let width = records
        .iter()
        .map(|r| r.reference.to_string().len())
        .max()
        .unwrap_or(0)
        .max("PACKAGE".len())
        + 2;
    println!(
        "{}{}",
        heading(&format!("{:<width$}{:<12}", "PACKAGE", "INSTALLED")),
        heading("ROOT")
    );
    for record in &records {
        let date = chrono::DateTime::from_timestamp(record.installed_at, 0)
            .unwrap_or_default()
            .format("%Y-%m-%d")
            .to_string();
        let missing = if record.exists() { "" } else { " (missing)" };
        println!(
            "{:<width$}{:<12}{}{missing}",
            record.reference.to_string(),
            date,
            record.install_path.display()
        );
    }
    Ok(())
}
