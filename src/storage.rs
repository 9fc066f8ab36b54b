//! Output sink: where downloaded datasets and run reports land on disk.
//!
//! Layout under the output directory:
//! `{output_dir}/{dd-mm-YYYY}/raw/{name}.{ext}` for datasets and
//! `{output_dir}/{dd-mm-YYYY}/reports/` for run reports.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::browser::DownloadedFile;
use crate::catalog::DatasetDescriptor;

/// Date directory format, e.g. `17-10-2026`.
pub const DATE_DIR_FORMAT: &str = "%d-%m-%Y";

const MAX_FILENAME_CHARS: usize = 100;
const DEFAULT_EXTENSION: &str = "csv";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SinkError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Persists downloaded bytes. Called once per successful dataset.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn save(
        &self,
        descriptor: &DatasetDescriptor,
        file: &DownloadedFile,
    ) -> Result<PathBuf, SinkError>;
}

/// Directories for one dated run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub root: PathBuf,
    pub raw_dir: PathBuf,
    pub reports_dir: PathBuf,
}

impl RunLayout {
    pub fn for_date(output_dir: &Path, date: NaiveDate) -> Self {
        let root = output_dir.join(date.format(DATE_DIR_FORMAT).to_string());
        Self {
            raw_dir: root.join("raw"),
            reports_dir: root.join("reports"),
            root,
        }
    }

    pub fn today(output_dir: &Path) -> Self {
        Self::for_date(output_dir, chrono::Local::now().date_naive())
    }

    /// The most recent dated run directory under `output_dir`, if any.
    pub fn latest(output_dir: &Path) -> Option<Self> {
        let entries = std::fs::read_dir(output_dir).ok()?;
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let name = e.file_name();
                NaiveDate::parse_from_str(name.to_str()?, DATE_DIR_FORMAT).ok()
            })
            .max()
            .map(|date| Self::for_date(output_dir, date))
    }

    pub fn create(&self) -> Result<(), SinkError> {
        for dir in [&self.raw_dir, &self.reports_dir] {
            std::fs::create_dir_all(dir).map_err(|e| SinkError::io(dir, e))?;
        }
        Ok(())
    }

    pub fn report_path(&self, name: &str) -> PathBuf {
        self.reports_dir.join(name)
    }

    /// Write `value` as pretty JSON into the reports directory.
    pub fn write_json_report<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf, SinkError> {
        let path = self.report_path(name);
        let json = serde_json::to_vec_pretty(value)?;
        write_atomic(&path, &json)?;
        Ok(path)
    }

    pub fn write_text_report(&self, name: &str, text: &str) -> Result<PathBuf, SinkError> {
        let path = self.report_path(name);
        write_atomic(&path, text.as_bytes())?;
        Ok(path)
    }
}

/// Sanitize a display name for use as a filename.
///
/// Drops everything but word characters, whitespace and hyphens, joins
/// whitespace runs with `_`, and caps the length.
pub fn sanitize_filename(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();

    kept.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .take(MAX_FILENAME_CHARS)
        .collect()
}

/// Filename stem for a dataset: its sanitized display name, or its id.
pub fn dataset_file_stem(descriptor: &DatasetDescriptor) -> String {
    let stem = sanitize_filename(&descriptor.display_name);
    if stem.is_empty() {
        sanitize_filename(&descriptor.id)
    } else {
        stem
    }
}

/// Write through a temporary sibling and rename into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SinkError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| SinkError::io(parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| SinkError::io(parent, e))?;
    tmp.write_all(bytes).map_err(|e| SinkError::io(path, e))?;
    tmp.persist(path).map_err(|e| SinkError::io(path, e.error))?;
    Ok(())
}

/// Writes datasets into a dated run directory.
pub struct FsSink {
    layout: RunLayout,
    /// Claimed filenames and the dataset that owns each.
    claimed: Mutex<HashMap<String, String>>,
}

impl FsSink {
    pub fn new(layout: RunLayout) -> Result<Self, SinkError> {
        layout.create()?;
        info!("Writing datasets to {}", layout.raw_dir.display());
        Ok(Self {
            layout,
            claimed: Mutex::new(HashMap::new()),
        })
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    fn claim_filename(&self, descriptor: &DatasetDescriptor, ext: &str) -> String {
        let stem = dataset_file_stem(descriptor);
        let preferred = format!("{}.{}", stem, ext);
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());

        let name = match claimed.get(&preferred) {
            Some(owner) if owner != &descriptor.id => {
                let alt = format!("{}_{}.{}", stem, sanitize_filename(&descriptor.id), ext);
                debug!(
                    "Filename {} already used by {}, saving {} as {}",
                    preferred, owner, descriptor.id, alt
                );
                alt
            }
            _ => preferred,
        };
        claimed.insert(name.clone(), descriptor.id.clone());
        name
    }
}

#[async_trait]
impl OutputSink for FsSink {
    async fn save(
        &self,
        descriptor: &DatasetDescriptor,
        file: &DownloadedFile,
    ) -> Result<PathBuf, SinkError> {
        let ext = file
            .extension()
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
        let name = self.claim_filename(descriptor, &ext);
        let path = self.layout.raw_dir.join(name);

        write_atomic(&path, &file.bytes)?;
        debug!("Saved {} ({} bytes) to {}", descriptor.id, file.bytes.len(), path.display());
        Ok(path)
    }
}
