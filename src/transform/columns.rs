//! Remove flag columns from downloaded CSV files, in place.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::csv::Table;
use super::{TransformError, STRIP_COLUMNS_REPORT_JSON};
use crate::storage::{write_atomic, RunLayout};

const SEPARATOR: char = ',';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StripStatus {
    Stripped,
    Untouched,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StripEntry {
    pub file: String,
    pub status: StripStatus,
    pub removed: Vec<String>,
    pub bytes_before: u64,
    pub bytes_after: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StripReport {
    pub generated_at: DateTime<Utc>,
    pub raw_dir: String,
    pub columns: Vec<String>,
    pub stripped: usize,
    pub untouched: usize,
    pub failed: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub files: Vec<StripEntry>,
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Strip matching columns from one file. Header matching ignores case and
/// surrounding whitespace.
pub fn strip_file(path: &Path, columns: &[String]) -> StripEntry {
    let mut entry = StripEntry {
        file: path.display().to_string(),
        status: StripStatus::Untouched,
        removed: Vec::new(),
        bytes_before: 0,
        bytes_after: 0,
        error: None,
    };

    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            entry.status = StripStatus::Failed;
            entry.error = Some(e.to_string());
            return entry;
        }
    };
    entry.bytes_before = bytes.len() as u64;
    entry.bytes_after = entry.bytes_before;

    let text = match std::str::from_utf8(&bytes) {
        Ok(t) => t,
        Err(e) => {
            warn!("{} is not valid UTF-8, left as is: {}", path.display(), e);
            entry.status = StripStatus::Failed;
            entry.error = Some(format!("not valid UTF-8: {}", e));
            return entry;
        }
    };
    let mut table = Table::parse(text, SEPARATOR);

    let wanted: Vec<String> = columns.iter().map(|c| normalize(c)).collect();
    let indices: Vec<usize> = match table.header() {
        Some(header) => header
            .iter()
            .enumerate()
            .filter(|(_, h)| wanted.contains(&normalize(h)))
            .map(|(i, h)| {
                entry.removed.push(h.trim().to_string());
                i
            })
            .collect(),
        None => Vec::new(),
    };

    if indices.is_empty() {
        debug!("{}: no flag columns", path.display());
        return entry;
    }

    table.remove_columns(&indices);
    let out = table.to_bytes(SEPARATOR);
    if let Err(e) = write_atomic(path, &out) {
        warn!("Could not rewrite {}: {}", path.display(), e);
        entry.status = StripStatus::Failed;
        entry.error = Some(e.to_string());
        return entry;
    }

    entry.bytes_after = out.len() as u64;
    entry.status = StripStatus::Stripped;
    debug!("{}: removed {:?}", path.display(), entry.removed);
    entry
}

/// Strip `columns` from every `*.csv` in the run's raw directory and write
/// the strip report.
pub fn strip_columns(layout: &RunLayout, columns: &[String]) -> Result<StripReport, TransformError> {
    let dir = &layout.raw_dir;
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| TransformError::io(dir, e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
        })
        .collect();
    paths.sort();

    let files: Vec<StripEntry> = paths.iter().map(|p| strip_file(p, columns)).collect();
    let count = |status| files.iter().filter(|f| f.status == status).count();

    let report = StripReport {
        generated_at: Utc::now(),
        raw_dir: dir.display().to_string(),
        columns: columns.to_vec(),
        stripped: count(StripStatus::Stripped),
        untouched: count(StripStatus::Untouched),
        failed: count(StripStatus::Failed),
        bytes_before: files.iter().map(|f| f.bytes_before).sum(),
        bytes_after: files.iter().map(|f| f.bytes_after).sum(),
        files,
    };

    layout.write_json_report(STRIP_COLUMNS_REPORT_JSON, &report)?;
    info!(
        "Stripped columns: {} files changed, {} untouched, {} failed",
        report.stripped, report.untouched, report.failed
    );
    Ok(report)
}
