//! Download task execution.
//!
//! [`DownloadExecutor`] runs the navigate → locate → click → await sequence
//! for one dataset on one session, with bounded retries. It always resolves
//! a task, except when the session itself dies: then it hands the task back
//! so the pool can re-queue it on a fresh session.

mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::browser::{BrowserSession, DownloadedFile, SessionError};
use crate::catalog::DatasetDescriptor;
use crate::pool::{EventSender, PoolEvent};
use crate::storage::OutputSink;

pub use types::{DownloadFlow, DownloadTask, ErrorKind, TaskOutcome, TaskStatus};

/// Interval between control probes while polling.
pub const CONTROL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Per-attempt knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_attempts: u32,
    pub download_timeout: Duration,
    /// Applied before each retry; the same delay the pool uses between tasks.
    pub retry_delay: Duration,
    pub control_poll_window: Duration,
    pub control_poll_interval: Duration,
    /// Query-string language appended to source URLs.
    pub language: Option<String>,
    /// Session faults per task that do not count as attempts.
    pub free_session_faults: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            download_timeout: Duration::from_millis(60_000),
            retry_delay: Duration::from_millis(1_000),
            control_poll_window: Duration::from_millis(15_000),
            control_poll_interval: CONTROL_POLL_INTERVAL,
            language: Some("es".to_string()),
            free_session_faults: 1,
        }
    }
}

/// What happened to a task on this session.
#[derive(Debug)]
pub enum Execution {
    /// Terminal outcome; report it.
    Resolved(TaskOutcome),
    /// The session died. Replace it and re-queue the task.
    SessionLost(SessionError),
}

pub struct DownloadExecutor {
    config: ExecutorConfig,
    flow: Arc<DownloadFlow>,
    sink: Arc<dyn OutputSink>,
    events: Option<EventSender>,
}

impl DownloadExecutor {
    pub fn new(config: ExecutorConfig, flow: Arc<DownloadFlow>, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            config,
            flow,
            sink,
            events: None,
        }
    }

    /// Report retried attempts on `events`.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Drive `task` on `session` until it resolves or the session is lost.
    ///
    /// Attempt bookkeeping lives in `task`, so a re-queued task resumes with
    /// its counts intact.
    pub async fn execute(
        &self,
        task: &mut DownloadTask,
        session: &mut dyn BrowserSession,
        worker_id: usize,
    ) -> Execution {
        task.mark_dispatched();

        loop {
            task.attempts_made += 1;
            debug!(
                "[worker {}] {} attempt {}/{}",
                worker_id,
                task.id(),
                task.attempts_made,
                self.config.max_attempts
            );

            let err = match self.attempt(&task.descriptor, session).await {
                Ok(file) => return Execution::Resolved(self.store(task, &file, worker_id).await),
                Err(e) => e,
            };

            if err.is_fault() {
                task.session_faults += 1;
                if task.session_faults <= self.config.free_session_faults {
                    // Session death is not the dataset's fault.
                    task.attempts_made -= 1;
                    warn!("[worker {}] {}: {}", worker_id, task.id(), err);
                    return Execution::SessionLost(err);
                }
                task.record_error(&err);
                if task.attempts_made >= self.config.max_attempts {
                    error!(
                        "[worker {}] {} failed after {} attempts: {}",
                        worker_id,
                        task.id(),
                        task.attempts_made,
                        err
                    );
                    return Execution::Resolved(task.exhausted(worker_id));
                }
                return Execution::SessionLost(err);
            }

            task.record_error(&err);
            if task.attempts_made >= self.config.max_attempts {
                error!(
                    "[worker {}] {} failed after {} attempts: {}",
                    worker_id,
                    task.id(),
                    task.attempts_made,
                    err
                );
                return Execution::Resolved(task.exhausted(worker_id));
            }

            warn!(
                "[worker {}] {} attempt {} failed ({}), retrying",
                worker_id,
                task.id(),
                task.attempts_made,
                err
            );
            if let Some(ref tx) = self.events {
                let _ = tx.send(PoolEvent::AttemptFailed {
                    worker_id,
                    dataset_id: task.id().to_string(),
                    attempt: task.attempts_made,
                    error: err.to_string(),
                });
            }
            tokio::time::sleep(self.config.retry_delay).await;

            // A reset fault follows an attempt that was already counted, so
            // it leaves the task's free session faults untouched.
            if let Err(e) = session.reset().await {
                if e.is_fault() {
                    warn!(
                        "[worker {}] {}: session lost during reset: {}",
                        worker_id,
                        task.id(),
                        e
                    );
                    return Execution::SessionLost(e);
                }
                debug!("[worker {}] reset before retry failed: {}", worker_id, e);
            }
        }
    }

    /// One pass through the flow.
    async fn attempt(
        &self,
        descriptor: &DatasetDescriptor,
        session: &mut dyn BrowserSession,
    ) -> Result<DownloadedFile, SessionError> {
        let url = descriptor.navigation_url(self.config.language.as_deref());
        session.navigate(&url).await?;

        let (trigger, revealing) = self
            .flow
            .steps
            .split_last()
            .ok_or_else(|| SessionError::ControlNotFound("(empty download flow)".to_string()))?;

        for step in revealing {
            let handle = session
                .find_in_frames(
                    step,
                    self.config.control_poll_window,
                    self.config.control_poll_interval,
                )
                .await?;
            session.click(&handle).await?;
            tokio::time::sleep(self.flow.settle()).await;
        }

        let handle = session
            .find_in_frames(
                trigger,
                self.config.control_poll_window,
                self.config.control_poll_interval,
            )
            .await?;
        session.click(&handle).await?;

        session.await_download(self.config.download_timeout).await
    }

    async fn store(&self, task: &DownloadTask, file: &DownloadedFile, worker_id: usize) -> TaskOutcome {
        match self.sink.save(&task.descriptor, file).await {
            Ok(path) => {
                info!(
                    "[worker {}] {} saved to {} ({} bytes, attempt {})",
                    worker_id,
                    task.id(),
                    path.display(),
                    file.bytes.len(),
                    task.attempts_made
                );
                task.succeeded(worker_id, &path, file.bytes.len() as u64)
            }
            Err(e) => {
                error!("[worker {}] {} could not be stored: {}", worker_id, task.id(), e);
                task.failed(Some(worker_id), ErrorKind::StorageFailed, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    use async_trait::async_trait;

    use crate::browser::{ControlHandle, ControlLocator};
    use crate::storage::SinkError;

    /// Replays one scripted result per attempt.
    struct Scripted {
        results: VecDeque<Result<(), SessionError>>,
        resets: usize,
        reset_fails: bool,
        navigated: Vec<String>,
    }

    impl Scripted {
        fn new(results: Vec<Result<(), SessionError>>) -> Self {
            Self {
                results: results.into(),
                resets: 0,
                reset_fails: false,
                navigated: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl BrowserSession for Scripted {
        async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
            self.navigated.push(url.to_string());
            Ok(())
        }

        async fn probe_frames(
            &mut self,
            locator: &ControlLocator,
        ) -> Result<Option<ControlHandle>, SessionError> {
            Ok(Some(ControlHandle {
                locator: locator.name.clone(),
                frame_path: vec![],
                selector: "x".to_string(),
                index: 0,
            }))
        }

        async fn click(&mut self, _handle: &ControlHandle) -> Result<(), SessionError> {
            Ok(())
        }

        async fn await_download(&mut self, _timeout: Duration) -> Result<DownloadedFile, SessionError> {
            match self.results.pop_front().unwrap_or(Ok(())) {
                Ok(()) => Ok(DownloadedFile {
                    suggested_filename: Some("data.csv".to_string()),
                    bytes: b"a,b\n1,2\n".to_vec(),
                }),
                Err(e) => Err(e),
            }
        }

        async fn reset(&mut self) -> Result<(), SessionError> {
            self.resets += 1;
            if self.reset_fails {
                return Err(SessionError::Fault("reset: connection closed".into()));
            }
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct NullSink {
        fail: bool,
    }

    #[async_trait]
    impl OutputSink for NullSink {
        async fn save(
            &self,
            descriptor: &DatasetDescriptor,
            _file: &DownloadedFile,
        ) -> Result<PathBuf, SinkError> {
            if self.fail {
                return Err(SinkError::Io {
                    path: PathBuf::from("/ro"),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                });
            }
            Ok(PathBuf::from(format!("/mem/{}.csv", descriptor.id)))
        }
    }

    fn executor(max_attempts: u32, fail_sink: bool) -> DownloadExecutor {
        let config = ExecutorConfig {
            max_attempts,
            ..Default::default()
        };
        DownloadExecutor::new(
            config,
            Arc::new(DownloadFlow::default()),
            Arc::new(NullSink { fail: fail_sink }),
        )
    }

    fn task() -> DownloadTask {
        DownloadTask::new(Arc::new(DatasetDescriptor::new(
            "DF_A",
            "A",
            "https://stat.example.cl/Index.aspx?DataSetCode=A",
            "g",
        )))
    }

    fn timeout() -> SessionError {
        SessionError::DownloadTimeout(Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_retry_and_resets_between() {
        let mut session = Scripted::new(vec![Err(timeout()), Ok(())]);
        let mut task = task();
        let result = executor(3, false).execute(&mut task, &mut session, 0).await;

        let Execution::Resolved(outcome) = result else {
            panic!("expected resolution");
        };
        assert_eq!(outcome.status, TaskStatus::Success);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.saved_path.as_deref(), Some("/mem/DF_A.csv"));
        assert_eq!(session.resets, 1);
        assert!(session.navigated[0].ends_with("&lang=es"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_with_last_error() {
        let mut session = Scripted::new(vec![Err(timeout()), Err(timeout()), Err(timeout())]);
        let mut task = task();
        let Execution::Resolved(outcome) = executor(2, false).execute(&mut task, &mut session, 1).await
        else {
            panic!("expected resolution");
        };
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.error_kind, Some(ErrorKind::DownloadTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn first_session_fault_is_free() {
        let exec = executor(2, false);
        let mut task = task();

        let mut dying = Scripted::new(vec![Err(SessionError::Fault("crashed".into()))]);
        let result = exec.execute(&mut task, &mut dying, 0).await;
        assert!(matches!(result, Execution::SessionLost(_)));
        assert_eq!(task.attempts_made, 0);

        let mut fresh = Scripted::new(vec![Ok(())]);
        let Execution::Resolved(outcome) = exec.execute(&mut task, &mut fresh, 1).await else {
            panic!("expected resolution");
        };
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn recurring_session_faults_count_as_attempts() {
        let exec = executor(2, false);
        let mut task = task();
        let fault = || Scripted::new(vec![Err(SessionError::Fault("crashed".into()))]);

        assert!(matches!(
            exec.execute(&mut task, &mut fault(), 0).await,
            Execution::SessionLost(_)
        ));
        assert!(matches!(
            exec.execute(&mut task, &mut fault(), 0).await,
            Execution::SessionLost(_)
        ));
        assert_eq!(task.attempts_made, 1);
        let Execution::Resolved(outcome) = exec.execute(&mut task, &mut fault(), 0).await else {
            panic!("expected resolution");
        };
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.error_kind, Some(ErrorKind::SessionFault));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_fault_keeps_the_free_session_fault() {
        let exec = executor(3, false);
        let mut task = task();

        let mut broken_reset = Scripted::new(vec![Err(timeout())]);
        broken_reset.reset_fails = true;
        let result = exec.execute(&mut task, &mut broken_reset, 0).await;
        assert!(matches!(result, Execution::SessionLost(ref e) if e.is_fault()));
        assert_eq!(task.attempts_made, 1);
        assert_eq!(task.session_faults, 0);

        let mut dying = Scripted::new(vec![Err(SessionError::Fault("crashed".into()))]);
        let result = exec.execute(&mut task, &mut dying, 0).await;
        assert!(matches!(result, Execution::SessionLost(_)));
        assert_eq!(task.attempts_made, 1, "crash after a reset fault is still free");

        let mut fresh = Scripted::new(vec![Ok(())]);
        let Execution::Resolved(outcome) = exec.execute(&mut task, &mut fresh, 0).await else {
            panic!("expected resolution");
        };
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_is_storage_failed() {
        let mut session = Scripted::new(vec![Ok(())]);
        let mut task = task();
        let Execution::Resolved(outcome) = executor(2, true).execute(&mut task, &mut session, 0).await
        else {
            panic!("expected resolution");
        };
        assert_eq!(outcome.error_kind, Some(ErrorKind::StorageFailed));
        assert!(outcome.error_message.unwrap().contains("read-only"));
    }
}
