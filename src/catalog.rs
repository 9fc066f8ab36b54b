//! Dataset catalog loading.
//!
//! The catalog is the fixed, ordered list of datasets a run acquires. Order
//! is preserved from the source file and doubles as the processing priority.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while loading a catalog. All of them abort the run.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog not found at {path}: {source}")]
    Missing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed catalog: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("catalog entry {index} is invalid: {reason}")]
    InvalidEntry { index: usize, reason: String },
    #[error("duplicate dataset id '{0}' in catalog")]
    DuplicateId(String),
}

fn default_category() -> String {
    "general".to_string()
}

/// One downloadable dataset. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDescriptor {
    pub id: String,
    #[serde(alias = "display_name", alias = "nombre", alias = "name")]
    pub display_name: String,
    #[serde(rename = "sourceURL", alias = "source_url", alias = "sourceUrl", alias = "url")]
    pub source_url: String,
    #[serde(default = "default_category", alias = "categoria")]
    pub category: String,
}

impl DatasetDescriptor {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        source_url: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            source_url: source_url.into(),
            category: category.into(),
        }
    }

    /// URL to navigate to, with the portal language parameter appended when
    /// one is configured and the URL does not already carry it.
    pub fn navigation_url(&self, language: Option<&str>) -> String {
        let Some(lang) = language.filter(|l| !l.is_empty()) else {
            return self.source_url.clone();
        };

        match url::Url::parse(&self.source_url) {
            Ok(mut parsed) => {
                if parsed.query_pairs().any(|(k, _)| k == "lang") {
                    return self.source_url.clone();
                }
                parsed.query_pairs_mut().append_pair("lang", lang);
                parsed.to_string()
            }
            Err(_) => self.source_url.clone(),
        }
    }
}

/// Accepted top-level shapes: a bare array or `{ "datasets": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    Wrapped { datasets: Vec<DatasetDescriptor> },
    Bare(Vec<DatasetDescriptor>),
}

/// The ordered, validated dataset list.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    datasets: Vec<DatasetDescriptor>,
}

impl Catalog {
    /// Load and validate a catalog from a JSON file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Missing {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_json(&raw)?;
        info!(
            "Loaded {} datasets from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Parse and validate a catalog from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let datasets = match serde_json::from_str::<CatalogFile>(raw)? {
            CatalogFile::Wrapped { datasets } | CatalogFile::Bare(datasets) => datasets,
        };
        Self::from_descriptors(datasets)
    }

    /// Validate an in-memory descriptor list.
    pub fn from_descriptors(datasets: Vec<DatasetDescriptor>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::with_capacity(datasets.len());

        for (index, ds) in datasets.iter().enumerate() {
            if ds.id.trim().is_empty() {
                return Err(CatalogError::InvalidEntry {
                    index,
                    reason: "empty id".to_string(),
                });
            }
            if let Err(e) = url::Url::parse(&ds.source_url) {
                return Err(CatalogError::InvalidEntry {
                    index,
                    reason: format!("bad source URL '{}': {}", ds.source_url, e),
                });
            }
            if !seen.insert(ds.id.as_str()) {
                return Err(CatalogError::DuplicateId(ds.id.clone()));
            }
            debug!("Catalog entry {}: {} ({})", index, ds.id, ds.category);
        }

        Ok(Self { datasets })
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn datasets(&self) -> &[DatasetDescriptor] {
        &self.datasets
    }

    /// The first `limit` descriptors in catalog order, or all of them.
    pub fn select(&self, limit: Option<usize>) -> Vec<DatasetDescriptor> {
        let take = limit.unwrap_or(self.datasets.len()).min(self.datasets.len());
        self.datasets[..take].to_vec()
    }

    pub fn into_inner(self) -> Vec<DatasetDescriptor> {
        self.datasets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WRAPPED: &str = r#"{
        "datasets": [
            {"id": "DF_A", "nombre": "Calidad del aire", "url": "https://stat.example.cl/?q=1", "categoria": "aire"},
            {"id": "DF_B", "displayName": "Agua", "sourceURL": "https://stat.example.cl/?q=2"}
        ]
    }"#;

    #[test]
    fn loads_wrapped_catalog_with_aliases() {
        let catalog = Catalog::from_json(WRAPPED).unwrap();
        assert_eq!(catalog.len(), 2);
        let first = &catalog.datasets()[0];
        assert_eq!(first.id, "DF_A");
        assert_eq!(first.display_name, "Calidad del aire");
        assert_eq!(first.category, "aire");
        assert_eq!(catalog.datasets()[1].category, "general");
    }

    #[test]
    fn loads_bare_array() {
        let raw = r#"[{"id": "X", "displayName": "x", "sourceURL": "https://a.example/"}]"#;
        let catalog = Catalog::from_json(raw).unwrap();
        assert_eq!(catalog.datasets()[0].id, "X");
    }

    #[test]
    fn rejects_duplicate_ids() {
        let raw = r#"[
            {"id": "X", "displayName": "x", "sourceURL": "https://a.example/"},
            {"id": "X", "displayName": "y", "sourceURL": "https://b.example/"}
        ]"#;
        assert!(matches!(
            Catalog::from_json(raw),
            Err(CatalogError::DuplicateId(id)) if id == "X"
        ));
    }

    #[test]
    fn rejects_malformed_json_and_bad_urls() {
        assert!(matches!(
            Catalog::from_json("{not json"),
            Err(CatalogError::Malformed(_))
        ));
        let raw = r#"[{"id": "X", "displayName": "x", "sourceURL": "not a url"}]"#;
        assert!(matches!(
            Catalog::from_json(raw),
            Err(CatalogError::InvalidEntry { index: 0, .. })
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Catalog::load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, CatalogError::Missing { .. }));
    }

    #[test]
    fn select_caps_in_catalog_order() {
        let catalog = Catalog::from_json(WRAPPED).unwrap();
        let first = catalog.select(Some(1));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "DF_A");
        assert_eq!(catalog.select(Some(10)).len(), 2);
        assert_eq!(catalog.select(None).len(), 2);
    }

    #[test]
    fn navigation_url_appends_language_once() {
        let ds = DatasetDescriptor::new("A", "a", "https://stat.example.cl/Index.aspx?DataSetCode=X", "g");
        assert_eq!(
            ds.navigation_url(Some("es")),
            "https://stat.example.cl/Index.aspx?DataSetCode=X&lang=es"
        );
        let already = DatasetDescriptor::new("A", "a", "https://stat.example.cl/?lang=en", "g");
        assert_eq!(already.navigation_url(Some("es")), "https://stat.example.cl/?lang=en");
        assert_eq!(ds.navigation_url(None), ds.source_url);
        assert_eq!(ds.navigation_url(Some("")), ds.source_url);
    }
}
