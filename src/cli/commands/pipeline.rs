//! Full pipeline: fetch, standardize, strip columns.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::fetch::cmd_fetch;
use super::transform::{standardize_in, strip_in};
use crate::cli::icons::{dim_arrow, error, info, warn};
use crate::config::Settings;

pub const PIPELINE_REPORT_JSON: &str = "pipeline_report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum StepStatus {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PipelineStep {
    name: &'static str,
    status: StepStatus,
    detail: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PipelineReport {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    run_dir: String,
    steps: Vec<PipelineStep>,
}

/// Run every step and return the fetch failure count.
///
/// Transforms run even when some datasets failed, on whatever was saved.
pub async fn cmd_pipeline(
    settings: Arc<Settings>,
    show_progress: bool,
    mapping: Option<&Path>,
    keep_flags: bool,
) -> anyhow::Result<usize> {
    let started_at = Utc::now();
    let mut steps = Vec::new();

    println!("{} Step 1/3: fetch", info());
    let run = cmd_fetch(Arc::clone(&settings), show_progress).await?;
    let summary = &run.summary;
    steps.push(PipelineStep {
        name: "fetch",
        status: if summary.failed == 0 {
            StepStatus::Ok
        } else {
            StepStatus::Failed
        },
        detail: format!(
            "{}/{} datasets downloaded",
            summary.succeeded, summary.total
        ),
    });

    println!("{} Step 2/3: standardize", info());
    match mapping {
        Some(path) => match standardize_in(&run.layout, path) {
            Ok(report) => steps.push(PipelineStep {
                name: "standardize",
                status: if report.failed == 0 {
                    StepStatus::Ok
                } else {
                    StepStatus::Failed
                },
                detail: format!(
                    "{} renamed, {} unmapped, {} failed",
                    report.renamed, report.unmapped, report.failed
                ),
            }),
            Err(e) => {
                println!("  {} {:#}", error(), e);
                steps.push(PipelineStep {
                    name: "standardize",
                    status: StepStatus::Failed,
                    detail: format!("{:#}", e),
                });
            }
        },
        None => {
            println!("  {} no name mapping given, skipping", warn());
            steps.push(PipelineStep {
                name: "standardize",
                status: StepStatus::Skipped,
                detail: "no name mapping".to_string(),
            });
        }
    }

    println!("{} Step 3/3: strip columns", info());
    if keep_flags {
        println!("  {} --keep-flags given, skipping", warn());
        steps.push(PipelineStep {
            name: "strip-columns",
            status: StepStatus::Skipped,
            detail: "flag columns kept".to_string(),
        });
    } else {
        match strip_in(&run.layout, &settings.strip_columns) {
            Ok(report) => steps.push(PipelineStep {
                name: "strip-columns",
                status: if report.failed == 0 {
                    StepStatus::Ok
                } else {
                    StepStatus::Failed
                },
                detail: format!(
                    "{} stripped, {} untouched, {} failed",
                    report.stripped, report.untouched, report.failed
                ),
            }),
            Err(e) => {
                println!("  {} {:#}", error(), e);
                steps.push(PipelineStep {
                    name: "strip-columns",
                    status: StepStatus::Failed,
                    detail: format!("{:#}", e),
                });
            }
        }
    }

    let report = PipelineReport {
        started_at,
        finished_at: Utc::now(),
        run_dir: run.layout.root.display().to_string(),
        steps,
    };
    let path = run.layout.write_json_report(PIPELINE_REPORT_JSON, &report)?;
    println!("  {} Pipeline report: {}", dim_arrow(), path.display());

    Ok(summary.failed)
}
