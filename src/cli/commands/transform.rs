//! Post-download transform commands.

use std::path::Path;

use anyhow::Context;

use crate::cli::icons::{dim_arrow, error, success, warn};
use crate::config::Settings;
use crate::storage::RunLayout;
use crate::transform::{
    load_fetch_report, resolve_layout, standardize_names, strip_columns, NameMapping,
    RenameStatus, StandardizeReport, StripReport, StripStatus, STANDARDIZE_REPORT_JSON,
    STRIP_COLUMNS_REPORT_JSON,
};

/// Rename a run's downloaded files to their standard names.
pub async fn cmd_standardize(
    settings: &Settings,
    mapping: &Path,
    run_dir: Option<&Path>,
) -> anyhow::Result<StandardizeReport> {
    let layout = resolve_layout(&settings.output_dir, run_dir)?;
    standardize_in(&layout, mapping)
}

pub(super) fn standardize_in(layout: &RunLayout, mapping: &Path) -> anyhow::Result<StandardizeReport> {
    let mapping = NameMapping::load(mapping).context("failed to load name mapping")?;
    let summary = load_fetch_report(layout).context("run has no usable fetch report")?;

    println!(
        "{} Standardizing names in {}",
        dim_arrow(),
        layout.raw_dir.display()
    );
    let report = standardize_names(layout, &summary, &mapping)?;

    for entry in report.entries.iter().filter(|e| e.status != RenameStatus::Renamed) {
        match entry.status {
            RenameStatus::Unmapped => {
                println!("  {} {} has no mapping", warn(), entry.dataset_id);
            }
            _ => println!(
                "  {} {}: {}",
                error(),
                entry.dataset_id,
                entry.error.as_deref().unwrap_or("rename failed")
            ),
        }
    }
    println!(
        "{} {} renamed, {} unmapped, {} failed",
        if report.failed == 0 { success() } else { warn() },
        report.renamed,
        report.unmapped,
        report.failed
    );
    println!(
        "  {} Report: {}",
        dim_arrow(),
        layout.report_path(STANDARDIZE_REPORT_JSON).display()
    );
    Ok(report)
}

/// Remove flag columns from a run's CSV files.
pub async fn cmd_strip_columns(
    settings: &Settings,
    run_dir: Option<&Path>,
    columns: &[String],
) -> anyhow::Result<StripReport> {
    let layout = resolve_layout(&settings.output_dir, run_dir)?;
    let columns = if columns.is_empty() {
        settings.strip_columns.as_slice()
    } else {
        columns
    };
    strip_in(&layout, columns)
}

pub(super) fn strip_in(layout: &RunLayout, columns: &[String]) -> anyhow::Result<StripReport> {
    println!(
        "{} Removing columns {:?} from {}",
        dim_arrow(),
        columns,
        layout.raw_dir.display()
    );
    let report = strip_columns(layout, columns)?;

    for entry in report.files.iter().filter(|f| f.status == StripStatus::Failed) {
        println!(
            "  {} {}: {}",
            error(),
            entry.file,
            entry.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!(
        "{} {} stripped, {} untouched, {} failed ({} -> {} bytes)",
        if report.failed == 0 { success() } else { warn() },
        report.stripped,
        report.untouched,
        report.failed,
        report.bytes_before,
        report.bytes_after
    );
    println!(
        "  {} Report: {}",
        dim_arrow(),
        layout.report_path(STRIP_COLUMNS_REPORT_JSON).display()
    );
    Ok(report)
}
