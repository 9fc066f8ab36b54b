//! Worker pool: a fixed set of browser sessions draining a shared queue.
//!
//! Each worker owns exactly one session and runs one task at a time on it.
//! Outcomes flow to a single collector over a channel, so the reporter has
//! one writer. A run deadline (or an external cancel) abandons in-flight
//! tasks as `Cancelled` and resolves everything still queued the same way.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserSession, SessionFactory};
use crate::catalog::{CatalogError, DatasetDescriptor};
use crate::download::{DownloadExecutor, DownloadTask, ErrorKind, Execution, TaskOutcome};
use crate::report::{ReportError, RunReporter, RunSummary};

/// Run-fatal errors. Per-dataset failures never surface here.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("run invariant violated: {0}")]
    Invariant(#[from] ReportError),
}

/// Progress notifications for display. They never influence scheduling.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    WorkerReady {
        worker_id: usize,
    },
    TaskStarted {
        worker_id: usize,
        dataset_id: String,
        display_name: String,
        attempt: u32,
    },
    AttemptFailed {
        worker_id: usize,
        dataset_id: String,
        attempt: u32,
        error: String,
    },
    TaskFinished {
        worker_id: usize,
        outcome: TaskOutcome,
    },
    SessionReplaced {
        worker_id: usize,
        reason: String,
    },
    WorkerStopped {
        worker_id: usize,
    },
}

pub type EventSender = mpsc::UnboundedSender<PoolEvent>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on live sessions, hence on concurrent tasks.
    pub max_sessions: usize,
    /// Pause between two tasks on the same session.
    pub inter_task_delay: Duration,
    pub run_deadline: Option<Duration>,
    /// Extra tries when a session cannot be created.
    pub session_create_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 3,
            inter_task_delay: Duration::from_millis(1_000),
            run_deadline: None,
            session_create_retries: 2,
        }
    }
}

struct WorkerContext {
    config: PoolConfig,
    executor: Arc<DownloadExecutor>,
    factory: Arc<dyn SessionFactory>,
    queue: Arc<Mutex<VecDeque<DownloadTask>>>,
    outcomes: mpsc::UnboundedSender<TaskOutcome>,
    events: Option<EventSender>,
    cancel: CancellationToken,
}

impl WorkerContext {
    fn emit(&self, event: PoolEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }

    async fn next_task(&self) -> Option<DownloadTask> {
        self.queue.lock().await.pop_front()
    }

    async fn has_pending(&self) -> bool {
        !self.queue.lock().await.is_empty()
    }

    /// Pause unless cancelled first. Returns false on cancel.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Create a session, retrying with the inter-task delay as backoff.
    /// Gives up as soon as the run is cancelled, even mid-launch.
    async fn open_session(&self, worker_id: usize) -> Option<Box<dyn BrowserSession>> {
        let tries = self.config.session_create_retries + 1;
        for attempt in 1..=tries {
            let created = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("[worker {}] session creation abandoned: run cancelled", worker_id);
                    return None;
                }
                r = self.factory.create(worker_id) => r,
            };
            match created {
                Ok(session) => return Some(session),
                Err(e) => {
                    warn!(
                        "[worker {}] session creation failed ({}/{}): {}",
                        worker_id, attempt, tries, e
                    );
                    if attempt < tries && !self.pause(self.config.inter_task_delay).await {
                        return None;
                    }
                }
            }
        }
        error!("[worker {}] giving up, no session available", worker_id);
        None
    }

    /// Close a dead session and bring up a fresh one in its place.
    async fn replace_session(
        &self,
        worker_id: usize,
        session: &mut Box<dyn BrowserSession>,
        reason: String,
    ) -> bool {
        session.close().await;
        match self.open_session(worker_id).await {
            Some(fresh) => {
                *session = fresh;
                info!("[worker {}] session replaced ({})", worker_id, reason);
                self.emit(PoolEvent::SessionReplaced { worker_id, reason });
                true
            }
            None => false,
        }
    }

    fn report(&self, outcome: TaskOutcome) {
        if self.outcomes.send(outcome).is_err() {
            error!("outcome collector is gone");
        }
    }
}

async fn worker_loop(ctx: Arc<WorkerContext>, worker_id: usize) {
    let Some(mut session) = ctx.open_session(worker_id).await else {
        ctx.emit(PoolEvent::WorkerStopped { worker_id });
        return;
    };
    debug!("[worker {}] ready", worker_id);
    ctx.emit(PoolEvent::WorkerReady { worker_id });

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let Some(mut task) = ctx.next_task().await else {
            break;
        };

        ctx.emit(PoolEvent::TaskStarted {
            worker_id,
            dataset_id: task.id().to_string(),
            display_name: task.descriptor.display_name.clone(),
            attempt: task.attempts_made + 1,
        });

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            r = ctx.executor.execute(&mut task, session.as_mut(), worker_id) => Some(r),
        };

        match result {
            None => {
                warn!("[worker {}] {} abandoned: run cancelled", worker_id, task.id());
                let outcome = task.cancelled(Some(worker_id));
                ctx.emit(PoolEvent::TaskFinished {
                    worker_id,
                    outcome: outcome.clone(),
                });
                ctx.report(outcome);
                break;
            }
            Some(Execution::Resolved(outcome)) => {
                ctx.emit(PoolEvent::TaskFinished {
                    worker_id,
                    outcome: outcome.clone(),
                });
                ctx.report(outcome);

                if let Err(e) = session.reset().await {
                    if e.is_fault() && !ctx.replace_session(worker_id, &mut session, e.to_string()).await {
                        break;
                    }
                }
            }
            Some(Execution::SessionLost(e)) => {
                ctx.emit(PoolEvent::AttemptFailed {
                    worker_id,
                    dataset_id: task.id().to_string(),
                    attempt: task.attempts_made + 1,
                    error: e.to_string(),
                });
                // Back to the head of the queue; session death is not a dataset failure.
                ctx.queue.lock().await.push_front(task);
                if !ctx.replace_session(worker_id, &mut session, e.to_string()).await {
                    break;
                }
            }
        }

        if ctx.has_pending().await && !ctx.pause(ctx.config.inter_task_delay).await {
            break;
        }
    }

    session.close().await;
    debug!("[worker {}] stopped", worker_id);
    ctx.emit(PoolEvent::WorkerStopped { worker_id });
}

/// Bounded pool of browser sessions.
pub struct WorkerPool {
    config: PoolConfig,
    executor: Arc<DownloadExecutor>,
    factory: Arc<dyn SessionFactory>,
    events: Option<EventSender>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        executor: Arc<DownloadExecutor>,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            config,
            executor,
            factory,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Number of workers a run over `total` datasets will start.
    pub fn worker_count(&self, total: usize) -> usize {
        self.config.max_sessions.max(1).min(total)
    }

    pub async fn run(&self, descriptors: Vec<DatasetDescriptor>) -> Result<RunSummary, RunError> {
        self.run_with_cancel(descriptors, CancellationToken::new())
            .await
    }

    /// Process every descriptor once. Returns after all of them have an
    /// outcome, even when `cancel` fires or the deadline passes.
    pub async fn run_with_cancel(
        &self,
        descriptors: Vec<DatasetDescriptor>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let total = descriptors.len();
        let workers = self.worker_count(total);
        let mut reporter = RunReporter::new(&descriptors, started_at, workers);

        if total == 0 {
            info!("Nothing to download");
            return Ok(reporter.seal(Utc::now(), false)?);
        }

        info!("Downloading {} datasets with {} sessions", total, workers);

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let queue: Arc<Mutex<VecDeque<DownloadTask>>> = Arc::new(Mutex::new(
            descriptors
                .into_iter()
                .map(|d| DownloadTask::new(Arc::new(d)))
                .collect(),
        ));

        let ctx = Arc::new(WorkerContext {
            config: self.config.clone(),
            executor: self.executor.clone(),
            factory: self.factory.clone(),
            queue: queue.clone(),
            outcomes: outcome_tx,
            events: self.events.clone(),
            cancel: cancel.clone(),
        });

        let deadline_hit = Arc::new(AtomicBool::new(false));
        let deadline = self.config.run_deadline.map(|limit| {
            let cancel = cancel.clone();
            let hit = deadline_hit.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        warn!("Run deadline of {:?} reached, cancelling", limit);
                        hit.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                }
            })
        });

        let handles: Vec<_> = (0..workers)
            .map(|worker_id| tokio::spawn(worker_loop(ctx.clone(), worker_id)))
            .collect();

        // Workers own the only outcome senders; the channel closes when the last one exits.
        drop(ctx);

        let mut violation: Option<ReportError> = None;
        while let Some(outcome) = outcome_rx.recv().await {
            if let Err(e) = reporter.record(outcome) {
                error!("{}", e);
                if violation.is_none() {
                    violation = Some(e);
                    cancel.cancel();
                }
            }
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }

        if let Some(d) = deadline {
            d.abort();
        }
        if let Some(e) = violation {
            return Err(e.into());
        }

        let cancelled = cancel.is_cancelled();
        let remaining: Vec<DownloadTask> = queue.lock().await.drain(..).collect();
        for task in remaining {
            let outcome = if cancelled {
                task.cancelled(None)
            } else {
                task.failed(
                    None,
                    ErrorKind::SessionFault,
                    "no browser session available",
                )
            };
            reporter.record(outcome)?;
        }

        let summary = reporter.seal(Utc::now(), cancelled || deadline_hit.load(Ordering::SeqCst))?;
        info!(
            "Run finished: {}/{} succeeded, {} failed",
            summary.succeeded, summary.total, summary.failed
        );
        Ok(summary)
    }
}
