//! Browser session capability.
//!
//! The orchestrator only talks to browsers through [`BrowserSession`], so the
//! automation backend is pluggable. The chromiumoxide (CDP) backend lives in
//! [`chrome`]; tests drive the pool with scripted fakes.

#[cfg(feature = "browser")]
mod chrome;
mod config;
pub mod frames;

#[cfg(feature = "browser")]
pub use chrome::{ChromeSession, ChromeSessionFactory};
pub use config::{BrowserEngineConfig, DEFAULT_USER_AGENT};
pub use frames::{ControlHandle, ControlLocator};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::download::ErrorKind;

/// Failures a session can report.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The control never appeared within the polling window.
    #[error("control '{0}' not found in any frame")]
    ControlNotFound(String),
    /// The browser did not report a finished download in time.
    #[error("download did not complete within {0:?}")]
    DownloadTimeout(Duration),
    /// The page could not be loaded.
    #[error("navigation failed: {0}")]
    Navigation(String),
    /// The session itself is unusable (crashed browser, dropped connection).
    #[error("session fault: {0}")]
    Fault(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ControlNotFound(_) => ErrorKind::ControlNotFound,
            Self::DownloadTimeout(_) => ErrorKind::DownloadTimeout,
            Self::Navigation(_) => ErrorKind::NavigationFailed,
            Self::Fault(_) => ErrorKind::SessionFault,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }
}

/// A file captured from the browser's native download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    /// Filename the server suggested, if the browser reported one.
    pub suggested_filename: Option<String>,
    pub bytes: Vec<u8>,
}

impl DownloadedFile {
    /// Extension from the suggested filename, lowercased.
    pub fn extension(&self) -> Option<String> {
        let name = self.suggested_filename.as_deref()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() || ext.len() > 8 {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

/// One exclusively-owned browser execution context.
///
/// Calls on a session are strictly sequential; a worker holds its session
/// for the whole task.
#[async_trait]
pub trait BrowserSession: Send {
    /// Load `url` in the session's page.
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError>;

    /// Single search of the top document and all nested frames.
    ///
    /// `Ok(None)` means "not there yet"; the caller decides whether to poll.
    async fn probe_frames(
        &mut self,
        locator: &ControlLocator,
    ) -> Result<Option<ControlHandle>, SessionError>;

    /// Hover and click a previously located control.
    async fn click(&mut self, handle: &ControlHandle) -> Result<(), SessionError>;

    /// Wait for the browser's download-completion signal.
    async fn await_download(&mut self, timeout: Duration) -> Result<DownloadedFile, SessionError>;

    /// Clear navigation and cookie state without tearing the session down.
    async fn reset(&mut self) -> Result<(), SessionError>;

    /// Release the underlying browser. Must be safe to call more than once.
    async fn close(&mut self);

    /// Poll [`probe_frames`](Self::probe_frames) until the control appears or
    /// `window` elapses.
    async fn find_in_frames(
        &mut self,
        locator: &ControlLocator,
        window: Duration,
        interval: Duration,
    ) -> Result<ControlHandle, SessionError> {
        let deadline = Instant::now() + window;
        loop {
            if let Some(handle) = self.probe_frames(locator).await? {
                debug!(
                    "Found '{}' at frame path {:?}",
                    locator.name, handle.frame_path
                );
                return Ok(handle);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::ControlNotFound(locator.name.clone()));
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }
}

/// Creates sessions for pool workers, at startup and after faults.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, worker_id: usize) -> Result<Box<dyn BrowserSession>, SessionError>;
}
