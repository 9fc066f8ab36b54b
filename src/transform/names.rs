//! Rename downloaded files to their standard dataset names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{TransformError, STANDARDIZE_REPORT_JSON};
use crate::report::RunSummary;
use crate::storage::{sanitize_filename, RunLayout};

/// One mapping entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedName {
    #[serde(alias = "nombre_estandarizado", alias = "standard_name")]
    pub standard_name: String,
    #[serde(default, alias = "nombre_original", alias = "original_name")]
    pub original_name: Option<String>,
    #[serde(default, alias = "categoria")]
    pub category: Option<String>,
}

/// Dataset id to standard name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameMapping {
    pub mappings: HashMap<String, MappedName>,
}

impl NameMapping {
    pub fn load(path: &Path) -> Result<Self, TransformError> {
        let raw = std::fs::read_to_string(path).map_err(|e| TransformError::io(path, e))?;
        let mapping: Self = serde_json::from_str(&raw).map_err(|e| TransformError::Mapping {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        info!("Loaded {} name mappings", mapping.mappings.len());
        Ok(mapping)
    }

    pub fn get(&self, dataset_id: &str) -> Option<&MappedName> {
        self.mappings.get(dataset_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenameStatus {
    Renamed,
    Unmapped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameEntry {
    pub dataset_id: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub status: RenameStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardizeReport {
    pub generated_at: DateTime<Utc>,
    pub raw_dir: String,
    pub renamed: usize,
    pub unmapped: usize,
    pub failed: usize,
    pub entries: Vec<RenameEntry>,
}

fn rename_one(dataset_id: &str, from: &Path, mapping: &NameMapping) -> RenameEntry {
    let entry = |to: Option<&Path>, status, error: Option<String>| RenameEntry {
        dataset_id: dataset_id.to_string(),
        from: from.display().to_string(),
        to: to.map(|p| p.display().to_string()),
        status,
        error,
    };

    let Some(mapped) = mapping.get(dataset_id) else {
        debug!("No mapping for {}", dataset_id);
        return entry(None, RenameStatus::Unmapped, None);
    };

    let stem = sanitize_filename(&mapped.standard_name);
    if stem.is_empty() {
        return entry(
            None,
            RenameStatus::Failed,
            Some(format!("standard name '{}' is empty once sanitized", mapped.standard_name)),
        );
    }
    let ext = from
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("csv");
    let dir = from.parent().unwrap_or_else(|| Path::new("."));
    let to: PathBuf = dir.join(format!("{}.{}", stem, ext));

    if to == from {
        return entry(Some(&to), RenameStatus::Renamed, None);
    }
    if !from.exists() {
        // A previous pass already moved it.
        if to.exists() {
            return entry(Some(&to), RenameStatus::Renamed, None);
        }
        return entry(Some(&to), RenameStatus::Failed, Some("source file missing".to_string()));
    }
    if to.exists() {
        return entry(
            Some(&to),
            RenameStatus::Failed,
            Some("target already exists".to_string()),
        );
    }

    match std::fs::rename(from, &to) {
        Ok(()) => {
            debug!("{} -> {}", from.display(), to.display());
            entry(Some(&to), RenameStatus::Renamed, None)
        }
        Err(e) => {
            warn!("Could not rename {}: {}", from.display(), e);
            entry(Some(&to), RenameStatus::Failed, Some(e.to_string()))
        }
    }
}

/// Rename every successfully fetched file according to `mapping` and write
/// the standardize report into the run's reports directory.
pub fn standardize_names(
    layout: &RunLayout,
    summary: &RunSummary,
    mapping: &NameMapping,
) -> Result<StandardizeReport, TransformError> {
    let mut entries = Vec::new();

    for outcome in summary.successes() {
        let Some(ref saved) = outcome.saved_path else {
            continue;
        };
        let saved = PathBuf::from(saved);
        // Reports from another machine: fall back to the same name in this raw dir.
        let from = if saved.starts_with(&layout.raw_dir) || saved.exists() {
            saved
        } else {
            match saved.file_name() {
                Some(name) => layout.raw_dir.join(name),
                None => saved,
            }
        };
        entries.push(rename_one(&outcome.dataset_id, &from, mapping));
    }

    let count = |status| entries.iter().filter(|e| e.status == status).count();
    let report = StandardizeReport {
        generated_at: Utc::now(),
        raw_dir: layout.raw_dir.display().to_string(),
        renamed: count(RenameStatus::Renamed),
        unmapped: count(RenameStatus::Unmapped),
        failed: count(RenameStatus::Failed),
        entries,
    };

    layout.write_json_report(STANDARDIZE_REPORT_JSON, &report)?;
    info!(
        "Standardized names: {} renamed, {} unmapped, {} failed",
        report.renamed, report.unmapped, report.failed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DatasetDescriptor;
    use crate::download::DownloadTask;
    use crate::report::RunReporter;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn mapping() -> NameMapping {
        serde_json::from_str(
            r#"{"mappings": {
                "DF_A": {"nombre_estandarizado": "calidad aire diaria", "nombre_original": "Aire", "categoria": "aire"},
                "DF_B": {"standardName": "agua_potable"}
            }}"#,
        )
        .unwrap()
    }

    fn summary_for(layout: &RunLayout, ids: &[&str]) -> RunSummary {
        let descriptors: Vec<_> = ids
            .iter()
            .map(|id| DatasetDescriptor::new(*id, *id, "https://stat.example.cl/", "g"))
            .collect();
        let started = Utc::now();
        let mut reporter = RunReporter::new(&descriptors, started, 1);
        for d in descriptors {
            let path = layout.raw_dir.join(format!("{}.csv", d.id));
            std::fs::write(&path, b"a,b\n").unwrap();
            let mut task = DownloadTask::new(Arc::new(d));
            task.attempts_made = 1;
            reporter.record(task.succeeded(0, &path, 4)).unwrap();
        }
        reporter.seal(started, false).unwrap()
    }

    #[test]
    fn mapping_accepts_spanish_and_english_keys() {
        let m = mapping();
        assert_eq!(m.get("DF_A").unwrap().standard_name, "calidad aire diaria");
        assert_eq!(m.get("DF_A").unwrap().category.as_deref(), Some("aire"));
        assert_eq!(m.get("DF_B").unwrap().standard_name, "agua_potable");
    }

    #[test]
    fn renames_mapped_and_reports_unmapped() {
        let dir = tempdir().unwrap();
        let layout = RunLayout::today(dir.path());
        layout.create().unwrap();
        let summary = summary_for(&layout, &["DF_A", "DF_B", "DF_Z"]);

        let report = standardize_names(&layout, &summary, &mapping()).unwrap();
        assert_eq!(report.renamed, 2);
        assert_eq!(report.unmapped, 1);
        assert_eq!(report.failed, 0);
        assert!(layout.raw_dir.join("calidad_aire_diaria.csv").exists());
        assert!(layout.raw_dir.join("agua_potable.csv").exists());
        assert!(layout.raw_dir.join("DF_Z.csv").exists());
        assert!(layout.report_path(STANDARDIZE_REPORT_JSON).exists());

        // running again is a no-op, not a failure
        let again = standardize_names(&layout, &summary, &mapping()).unwrap();
        assert_eq!(again.renamed, 2);
        assert_eq!(again.failed, 0);
    }

    #[test]
    fn existing_target_is_not_overwritten() {
        let dir = tempdir().unwrap();
        let layout = RunLayout::today(dir.path());
        layout.create().unwrap();
        let summary = summary_for(&layout, &["DF_B"]);
        std::fs::write(layout.raw_dir.join("agua_potable.csv"), b"keep").unwrap();

        let report = standardize_names(&layout, &summary, &mapping()).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(
            std::fs::read(layout.raw_dir.join("agua_potable.csv")).unwrap(),
            b"keep"
        );
    }
}
