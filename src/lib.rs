//! ineacquire - concurrent acquisition of statistics portal datasets.
//!
//! Each dataset in a catalog is downloaded by driving a headless browser
//! through the portal's export menus. A bounded pool of browser sessions
//! works through the catalog, retries failed attempts, and produces a run
//! summary with exactly one outcome per dataset.

pub mod browser;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod download;
pub mod pool;
pub mod report;
pub mod storage;
pub mod transform;

pub use catalog::{Catalog, CatalogError, DatasetDescriptor};
pub use config::Settings;
pub use download::{DownloadExecutor, ErrorKind, TaskOutcome, TaskStatus};
pub use pool::{PoolConfig, PoolEvent, RunError, WorkerPool};
pub use report::{RunReporter, RunSummary};
