//! Post-download transforms.
//!
//! Both are purely syntactic and work on a run directory produced by a
//! fetch: renaming saved files to standard names, and removing flag columns
//! from the CSV files.

pub mod columns;
pub mod csv;
pub mod names;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::report::{RunSummary, FETCH_REPORT_JSON};
use crate::storage::{RunLayout, SinkError};

pub use columns::{strip_columns, StripEntry, StripReport, StripStatus};
pub use names::{standardize_names, NameMapping, RenameEntry, RenameStatus, StandardizeReport};

pub const STANDARDIZE_REPORT_JSON: &str = "standardize_report.json";
pub const STRIP_COLUMNS_REPORT_JSON: &str = "strip_columns_report.json";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("no run directory found under {0}")]
    NoRunDirectory(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid name mapping {path}: {message}")]
    Mapping { path: PathBuf, message: String },
    #[error("invalid fetch report {path}: {message}")]
    FetchReport { path: PathBuf, message: String },
    #[error(transparent)]
    Report(#[from] SinkError),
}

impl TransformError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The run directory to transform: an explicit one, or the newest dated one.
pub fn resolve_layout(output_dir: &Path, run_dir: Option<&Path>) -> Result<RunLayout, TransformError> {
    match run_dir {
        Some(root) => {
            if !root.is_dir() {
                return Err(TransformError::NoRunDirectory(root.to_path_buf()));
            }
            Ok(RunLayout {
                root: root.to_path_buf(),
                raw_dir: root.join("raw"),
                reports_dir: root.join("reports"),
            })
        }
        None => RunLayout::latest(output_dir)
            .ok_or_else(|| TransformError::NoRunDirectory(output_dir.to_path_buf())),
    }
}

/// Read the fetch report a run left behind.
pub fn load_fetch_report(layout: &RunLayout) -> Result<RunSummary, TransformError> {
    let path = layout.report_path(FETCH_REPORT_JSON);
    let raw = std::fs::read_to_string(&path).map_err(|e| TransformError::io(&path, e))?;
    serde_json::from_str(&raw).map_err(|e| TransformError::FetchReport {
        path,
        message: e.to_string(),
    })
}
