//! Run reporter: collects task outcomes into a sealed run summary.
//!
//! Outcomes arrive in completion order; the sealed summary lists them in
//! catalog order. Each dataset id may be recorded once.

mod render;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::catalog::DatasetDescriptor;
use crate::download::{TaskOutcome, TaskStatus};

pub use render::{format_bytes, render_text};

pub const FETCH_REPORT_JSON: &str = "fetch_report.json";
pub const FETCH_REPORT_TXT: &str = "fetch_report.txt";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    /// A second outcome for the same dataset: a scheduler defect.
    #[error("duplicate outcome for dataset '{0}'")]
    DuplicateOutcome(String),
    #[error("outcome for dataset '{0}' which is not part of this run")]
    UnknownDataset(String),
    #[error("run sealed with {} unresolved datasets: {}", .0.len(), .0.join(", "))]
    Incomplete(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    pub total_ms: u64,
    pub mean_task_ms: u64,
    pub min_task_ms: u64,
    pub max_task_ms: u64,
}

/// Aggregate of one run. Read-only once sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub total_bytes: u64,
    pub workers: usize,
    pub cancelled: bool,
    pub retried: usize,
    pub timings: Timings,
    pub per_dataset_outcomes: Vec<TaskOutcome>,
}

impl RunSummary {
    pub fn failures(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.per_dataset_outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn successes(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.per_dataset_outcomes.iter().filter(|o| o.is_success())
    }

    pub fn outcome(&self, dataset_id: &str) -> Option<&TaskOutcome> {
        self.per_dataset_outcomes
            .iter()
            .find(|o| o.dataset_id == dataset_id)
    }

    /// True when nothing failed.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Append-only accumulator for one run.
#[derive(Debug)]
pub struct RunReporter {
    slots: Vec<(String, Option<TaskOutcome>)>,
    index: HashMap<String, usize>,
    started_at: DateTime<Utc>,
    workers: usize,
    recorded: usize,
}

impl RunReporter {
    pub fn new(selected: &[DatasetDescriptor], started_at: DateTime<Utc>, workers: usize) -> Self {
        let slots: Vec<_> = selected.iter().map(|d| (d.id.clone(), None)).collect();
        let index = selected
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
        Self {
            slots,
            index,
            started_at,
            workers,
            recorded: 0,
        }
    }

    pub fn record(&mut self, outcome: TaskOutcome) -> Result<(), ReportError> {
        let slot = self
            .index
            .get(&outcome.dataset_id)
            .copied()
            .ok_or_else(|| ReportError::UnknownDataset(outcome.dataset_id.clone()))?;

        let entry = &mut self.slots[slot].1;
        if entry.is_some() {
            return Err(ReportError::DuplicateOutcome(outcome.dataset_id));
        }
        debug!(
            "Recorded {} ({:?}, {} attempts)",
            outcome.dataset_id, outcome.status, outcome.attempts
        );
        *entry = Some(outcome);
        self.recorded += 1;
        Ok(())
    }

    pub fn is_recorded(&self, dataset_id: &str) -> bool {
        self.index
            .get(dataset_id)
            .map(|&i| self.slots[i].1.is_some())
            .unwrap_or(false)
    }

    pub fn recorded(&self) -> usize {
        self.recorded
    }

    pub fn expected(&self) -> usize {
        self.slots.len()
    }

    /// Ids still waiting for an outcome, in catalog order.
    pub fn unresolved(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(_, o)| o.is_none())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Freeze the summary. Every selected dataset must have an outcome.
    pub fn seal(self, finished_at: DateTime<Utc>, cancelled: bool) -> Result<RunSummary, ReportError> {
        let missing = self.unresolved();
        if !missing.is_empty() {
            return Err(ReportError::Incomplete(missing));
        }

        let outcomes: Vec<TaskOutcome> = self.slots.into_iter().filter_map(|(_, o)| o).collect();
        let total = outcomes.len();
        let succeeded = outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Success)
            .count();
        let failed = total - succeeded;
        let success_rate = if total == 0 {
            0.0
        } else {
            (succeeded as f64 / total as f64 * 10_000.0).round() / 100.0
        };

        let durations: Vec<u64> = outcomes.iter().map(|o| o.duration_ms).collect();
        let timings = Timings {
            total_ms: (finished_at - self.started_at).num_milliseconds().max(0) as u64,
            mean_task_ms: if durations.is_empty() {
                0
            } else {
                durations.iter().sum::<u64>() / durations.len() as u64
            },
            min_task_ms: durations.iter().copied().min().unwrap_or(0),
            max_task_ms: durations.iter().copied().max().unwrap_or(0),
        };

        Ok(RunSummary {
            started_at: self.started_at,
            finished_at,
            total,
            succeeded,
            failed,
            success_rate,
            total_bytes: outcomes.iter().filter_map(|o| o.bytes).sum(),
            workers: self.workers,
            cancelled,
            retried: outcomes
                .iter()
                .filter(|o| o.is_success() && o.attempts > 1)
                .count(),
            timings,
            per_dataset_outcomes: outcomes,
        })
    }
}
