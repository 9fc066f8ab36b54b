//! Scripted browser sessions and an in-memory sink for pool tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ineacquire::browser::{
    BrowserSession, ControlHandle, ControlLocator, DownloadedFile, SessionError, SessionFactory,
};
use ineacquire::catalog::DatasetDescriptor;
use ineacquire::download::{DownloadExecutor, DownloadFlow, ExecutorConfig};
use ineacquire::pool::{EventSender, PoolConfig, WorkerPool};
use ineacquire::storage::{OutputSink, SinkError};

pub const PORTAL: &str = "https://portal.test/datasets/";

/// What a dataset does when a session tries to download it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Succeed,
    /// Control missing for the first `n` attempts, then fine.
    MissingControl(u32),
    /// Control never appears.
    NeverFound,
    /// Download never completes.
    AlwaysTimeout,
    /// The session dies on the first `n` attempts, then fine.
    Fault(u32),
    /// The session dies every time.
    AlwaysFault,
    /// Download hangs until cancelled.
    Hang,
}

#[derive(Default)]
pub struct Instruments {
    pub created: AtomicUsize,
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
    pub closed: AtomicUsize,
    /// Concurrent downloads in flight, and the most seen at once.
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    /// Attempts seen per dataset, across all sessions.
    pub attempts: Mutex<HashMap<String, u32>>,
}

impl Instruments {
    pub fn peak_sessions(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn created_sessions(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn attempts_for(&self, id: &str) -> u32 {
        self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

pub struct FakeSession {
    scripts: Arc<HashMap<String, Script>>,
    instruments: Arc<Instruments>,
    latency: Duration,
    current: Option<(String, u32)>,
    dead: bool,
    closed: bool,
}

impl FakeSession {
    fn script(&self) -> Script {
        self.current
            .as_ref()
            .and_then(|(id, _)| self.scripts.get(id).copied())
            .unwrap_or(Script::Succeed)
    }

    fn check_alive(&self) -> Result<(), SessionError> {
        if self.dead || self.closed {
            return Err(SessionError::Fault("browser connection lost".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        self.check_alive()?;
        let id = url
            .strip_prefix(PORTAL)
            .unwrap_or(url)
            .split('?')
            .next()
            .unwrap_or_default()
            .to_string();

        let attempt = {
            let mut attempts = self.instruments.attempts.lock().unwrap();
            let n = attempts.entry(id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        self.current = Some((id, attempt));

        match self.script() {
            Script::Fault(n) if attempt <= n => {
                self.dead = true;
                Err(SessionError::Fault("target crashed".to_string()))
            }
            Script::AlwaysFault => {
                self.dead = true;
                Err(SessionError::Fault("target crashed".to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn probe_frames(
        &mut self,
        locator: &ControlLocator,
    ) -> Result<Option<ControlHandle>, SessionError> {
        self.check_alive()?;
        let attempt = self.current.as_ref().map(|(_, a)| *a).unwrap_or(0);
        let present = match self.script() {
            Script::MissingControl(n) => attempt > n,
            Script::NeverFound => false,
            _ => true,
        };
        Ok(present.then(|| ControlHandle {
            locator: locator.name.clone(),
            frame_path: vec![0],
            selector: locator.selectors.first().cloned().unwrap_or_default(),
            index: 0,
        }))
    }

    async fn click(&mut self, _handle: &ControlHandle) -> Result<(), SessionError> {
        self.check_alive()
    }

    async fn await_download(&mut self, timeout: Duration) -> Result<DownloadedFile, SessionError> {
        self.check_alive()?;
        let instruments = self.instruments.clone();
        let now = instruments.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        instruments.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(instruments);

        match self.script() {
            Script::AlwaysTimeout => {
                tokio::time::sleep(timeout).await;
                Err(SessionError::DownloadTimeout(timeout))
            }
            Script::Hang => {
                std::future::pending::<()>().await;
                Err(SessionError::DownloadTimeout(timeout))
            }
            _ => {
                tokio::time::sleep(self.latency).await;
                let id = self
                    .current
                    .as_ref()
                    .map(|(id, _)| id.clone())
                    .unwrap_or_default();
                Ok(DownloadedFile {
                    suggested_filename: Some(format!("{}.csv", id)),
                    bytes: format!("id,value\n{},1\n", id).into_bytes(),
                })
            }
        }
    }

    async fn reset(&mut self) -> Result<(), SessionError> {
        self.check_alive()?;
        self.current = None;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.instruments.active.fetch_sub(1, Ordering::SeqCst);
            self.instruments.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct InFlight(Arc<Instruments>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeFactory {
    scripts: Arc<HashMap<String, Script>>,
    pub instruments: Arc<Instruments>,
    latency: Duration,
    /// Creation calls to refuse before succeeding; `usize::MAX` refuses all.
    refuse_creates: AtomicUsize,
}

impl FakeFactory {
    pub fn new(scripts: &[(&str, Script)]) -> Self {
        Self {
            scripts: Arc::new(
                scripts
                    .iter()
                    .map(|(id, s)| (id.to_string(), *s))
                    .collect(),
            ),
            instruments: Arc::new(Instruments::default()),
            latency: Duration::from_millis(500),
            refuse_creates: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn refusing(self, creates: usize) -> Self {
        self.refuse_creates.store(creates, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn create(&self, _worker_id: usize) -> Result<Box<dyn BrowserSession>, SessionError> {
        let refused = self
            .refuse_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == usize::MAX {
                    Some(n)
                } else {
                    n.checked_sub(1)
                }
            })
            .is_ok();
        if refused {
            return Err(SessionError::Fault("could not launch browser".to_string()));
        }

        self.instruments.created.fetch_add(1, Ordering::SeqCst);
        let now = self.instruments.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.instruments.peak.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(FakeSession {
            scripts: self.scripts.clone(),
            instruments: self.instruments.clone(),
            latency: self.latency,
            current: None,
            dead: false,
            closed: false,
        }))
    }
}

/// Keeps saved files in memory.
#[derive(Default)]
pub struct MemorySink {
    pub saved: Mutex<Vec<(String, usize)>>,
    /// Dataset ids whose save fails.
    pub reject: Vec<String>,
}

impl MemorySink {
    pub fn saved_ids(&self) -> Vec<String> {
        self.saved
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn save(
        &self,
        descriptor: &DatasetDescriptor,
        file: &DownloadedFile,
    ) -> Result<PathBuf, SinkError> {
        let path = PathBuf::from(format!("mem/{}.csv", descriptor.id));
        if self.reject.contains(&descriptor.id) {
            return Err(SinkError::Io {
                path,
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        self.saved
            .lock()
            .unwrap()
            .push((descriptor.id.clone(), file.bytes.len()));
        Ok(path)
    }
}

pub fn descriptors(ids: &[&str]) -> Vec<DatasetDescriptor> {
    ids.iter()
        .map(|id| {
            DatasetDescriptor::new(
                *id,
                format!("Dataset {}", id),
                format!("{}{}", PORTAL, id),
                "test",
            )
        })
        .collect()
}

/// A single-step flow so tests only exercise the trigger control.
pub fn flow() -> DownloadFlow {
    DownloadFlow {
        steps: vec![ControlLocator::new("download button", &["#download"], &["Download"])],
        settle_ms: 0,
    }
}

pub fn executor_config(max_attempts: u32) -> ExecutorConfig {
    ExecutorConfig {
        max_attempts,
        download_timeout: Duration::from_secs(5),
        retry_delay: Duration::from_millis(100),
        control_poll_window: Duration::from_secs(1),
        control_poll_interval: Duration::from_millis(250),
        language: None,
        free_session_faults: 1,
    }
}

pub fn pool_config(max_sessions: usize) -> PoolConfig {
    PoolConfig {
        max_sessions,
        inter_task_delay: Duration::from_millis(100),
        run_deadline: None,
        session_create_retries: 1,
    }
}

pub fn pool(
    config: PoolConfig,
    max_attempts: u32,
    factory: Arc<FakeFactory>,
    sink: Arc<MemorySink>,
) -> WorkerPool {
    let executor = DownloadExecutor::new(executor_config(max_attempts), Arc::new(flow()), sink);
    WorkerPool::new(config, Arc::new(executor), factory)
}

/// Like [`pool`], with both the executor and the pool reporting on `events`.
pub fn pool_with_events(
    config: PoolConfig,
    max_attempts: u32,
    factory: Arc<FakeFactory>,
    sink: Arc<MemorySink>,
    events: EventSender,
) -> WorkerPool {
    let executor = DownloadExecutor::new(executor_config(max_attempts), Arc::new(flow()), sink)
        .with_events(events.clone());
    WorkerPool::new(config, Arc::new(executor), factory).with_events(events)
}
