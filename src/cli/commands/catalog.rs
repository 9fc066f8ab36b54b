//! Catalog inspection command.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use console::style;

use crate::catalog::Catalog;
use crate::cli::icons::{dim_arrow, success};
use crate::config::Settings;

/// Validate a catalog and list its datasets.
pub async fn cmd_catalog(settings: &Settings, path: &Path, json: bool) -> anyhow::Result<()> {
    let catalog = Catalog::load(path)
        .with_context(|| format!("catalog {} is invalid", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(catalog.datasets())?);
        return Ok(());
    }

    let mut per_category: BTreeMap<&str, usize> = BTreeMap::new();
    for dataset in catalog.datasets() {
        *per_category.entry(dataset.category.as_str()).or_default() += 1;
    }

    println!(
        "{} {} datasets in {}",
        success(),
        catalog.len(),
        path.display()
    );
    for (category, count) in &per_category {
        println!("  {} {}: {}", dim_arrow(), category, count);
    }
    println!();

    let selected = catalog.select(settings.max_datasets);
    for dataset in &selected {
        println!(
            "  {:<24} {:<12} {}",
            style(&dataset.id).bold(),
            style(&dataset.category).dim(),
            dataset.display_name
        );
    }
    if selected.len() < catalog.len() {
        println!(
            "  {} {} more not selected (MAX_DATASETS={})",
            dim_arrow(),
            catalog.len() - selected.len(),
            selected.len()
        );
    }
    Ok(())
}
