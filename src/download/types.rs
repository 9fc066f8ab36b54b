//! Task state, outcomes and the download flow description.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::browser::{ControlLocator, SessionError};
use crate::catalog::DatasetDescriptor;

/// Why a dataset did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ControlNotFound,
    DownloadTimeout,
    NavigationFailed,
    SessionFault,
    Cancelled,
    StorageFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControlNotFound => "ControlNotFound",
            Self::DownloadTimeout => "DownloadTimeout",
            Self::NavigationFailed => "NavigationFailed",
            Self::SessionFault => "SessionFault",
            Self::Cancelled => "Cancelled",
            Self::StorageFailed => "StorageFailed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Success,
    Failed,
}

/// Terminal result for one dataset. Produced exactly once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub dataset_id: String,
    pub display_name: String,
    pub category: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// One dataset being worked on, with its attempt bookkeeping.
///
/// The task travels with the dataset through re-queues after session
/// faults, so attempt counts and the first-dispatch time survive a
/// session replacement.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub descriptor: Arc<DatasetDescriptor>,
    /// Attempts started so far. Free session faults are not counted.
    pub attempts_made: u32,
    pub last_error: Option<ErrorKind>,
    pub last_message: Option<String>,
    /// Session faults seen by this task, counted or not.
    pub session_faults: u32,
    first_dispatched: Option<Instant>,
}

impl DownloadTask {
    pub fn new(descriptor: Arc<DatasetDescriptor>) -> Self {
        Self {
            descriptor,
            attempts_made: 0,
            last_error: None,
            last_message: None,
            session_faults: 0,
            first_dispatched: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Note the first time a worker picked this task up.
    pub fn mark_dispatched(&mut self) {
        if self.first_dispatched.is_none() {
            self.first_dispatched = Some(Instant::now());
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.first_dispatched
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn record_error(&mut self, err: &SessionError) {
        self.last_error = Some(err.kind());
        self.last_message = Some(err.to_string());
    }

    fn outcome(&self, status: TaskStatus, worker_id: Option<usize>) -> TaskOutcome {
        TaskOutcome {
            dataset_id: self.descriptor.id.clone(),
            display_name: self.descriptor.display_name.clone(),
            category: self.descriptor.category.clone(),
            status,
            attempts: self.attempts_made,
            duration_ms: self.elapsed().as_millis() as u64,
            saved_path: None,
            bytes: None,
            error_kind: None,
            error_message: None,
            worker_id,
        }
    }

    pub fn succeeded(&self, worker_id: usize, saved_path: &Path, bytes: u64) -> TaskOutcome {
        TaskOutcome {
            saved_path: Some(saved_path.display().to_string()),
            bytes: Some(bytes),
            ..self.outcome(TaskStatus::Success, Some(worker_id))
        }
    }

    pub fn failed(
        &self,
        worker_id: Option<usize>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> TaskOutcome {
        TaskOutcome {
            error_kind: Some(kind),
            error_message: Some(message.into()),
            ..self.outcome(TaskStatus::Failed, worker_id)
        }
    }

    /// Failed with whatever error the last attempt left behind.
    pub fn exhausted(&self, worker_id: usize) -> TaskOutcome {
        let kind = self.last_error.unwrap_or(ErrorKind::SessionFault);
        let message = self
            .last_message
            .clone()
            .unwrap_or_else(|| kind.to_string());
        self.failed(Some(worker_id), kind, message)
    }

    pub fn cancelled(&self, worker_id: Option<usize>) -> TaskOutcome {
        self.failed(worker_id, ErrorKind::Cancelled, "run deadline exceeded")
    }
}

fn default_settle_ms() -> u64 {
    1000
}

/// The ordered controls that lead to the native download.
///
/// Every step but the last reveals something (a menu, a modal); the last
/// one triggers the download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFlow {
    pub steps: Vec<ControlLocator>,
    /// Pause after each revealing click.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl DownloadFlow {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Export menu, then the CSV entry, then the button inside the dialog iframe.
    pub fn statistics_portal() -> Self {
        Self {
            steps: vec![
                ControlLocator::new(
                    "export menu",
                    &["li#menubar-export", "#menubar-export", "[id*=\"menubar-export\"]"],
                    &["Exportar", "Export"],
                ),
                ControlLocator::new(
                    "csv export item",
                    &[
                        "li#menuitemExportCSV a",
                        "#menuitemExportCSV",
                        "[id*=\"ExportCSV\"]",
                    ],
                    &["Archivo de texto (CSV)", "Text file (CSV)"],
                ),
                ControlLocator::new(
                    "download button",
                    &[
                        "input[value=\"Descargar\"]",
                        "input[value=\"Download\"]",
                        "[id*=\"btnExport\"]",
                    ],
                    &["Descargar", "Download"],
                ),
            ],
            settle_ms: default_settle_ms(),
        }
    }
}

impl Default for DownloadFlow {
    fn default() -> Self {
        Self::statistics_portal()
    }
}
