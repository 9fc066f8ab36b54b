//! Chrome/Chromium session backend over CDP (chromiumoxide).
//!
//! Each session owns its own browser process (or its own connection to a
//! remote DevTools endpoint), one page, and a private download directory.
//! Downloads are captured with `Browser.setDownloadBehavior(allowAndName)`:
//! the page-scoped `downloadWillBegin` event names the guid, and the
//! browser-level `downloadProgress` stream reports when that guid is done.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::{
    DownloadProgressState, EventDownloadProgress, EventDownloadWillBegin,
    SetDownloadBehaviorBehavior,
    SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    ClearBrowserCacheParams, ClearBrowserCookiesParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::listeners::EventStream;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::{FutureExt, StreamExt};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frames::{click_script, parse_probe_result, probe_script};
use super::{
    BrowserEngineConfig, BrowserSession, ControlHandle, ControlLocator, DownloadedFile,
    SessionError, SessionFactory,
};

/// JavaScript to wait for page ready state.
const WAIT_FOR_READY_SCRIPT: &str = r#"
    new Promise((resolve) => {
        if (document.readyState === 'complete' || document.readyState === 'interactive') {
            resolve(document.readyState);
        } else {
            document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
            setTimeout(() => resolve('timeout'), 10000);
        }
    })
"#;

/// Pause after the DOM is ready so late scripts can build the menus.
const SETTLE_AFTER_LOAD: Duration = Duration::from_millis(1500);

/// Common Chrome executable paths to check.
const CHROME_PATHS: &[&str] = &[
    // Linux
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    // macOS
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    // Common install locations
    "/opt/google/chrome/google-chrome",
];

/// Find a Chrome executable on this host.
fn find_chrome(config: &BrowserEngineConfig) -> Result<PathBuf, SessionError> {
    if let Some(ref path) = config.executable {
        return Ok(path.clone());
    }

    for path in CHROME_PATHS {
        let p = std::path::Path::new(path);
        if p.exists() {
            info!("Found Chrome at: {}", path);
            return Ok(p.to_path_buf());
        }
    }

    for cmd in [
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
    ] {
        if let Ok(path) = which::which(cmd) {
            info!("Found Chrome in PATH: {}", path.display());
            return Ok(path);
        }
    }

    Err(SessionError::Fault(
        "Chrome/Chromium not found. Install chromium or set CHROME_PATH".to_string(),
    ))
}

/// Spawn the CDP handler loop; `alive` flips to false when the connection ends.
fn spawn_handler(mut handler: chromiumoxide::Handler, alive: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if h.is_err() {
                break;
            }
        }
        alive.store(false, Ordering::SeqCst);
    })
}

/// Resolve a DevTools HTTP endpoint to its WebSocket debugger URL.
async fn remote_ws_url(url: &str, timeout: Duration) -> Result<String, SessionError> {
    if url.contains("/devtools/browser/") {
        return Ok(url.to_string());
    }

    let http_url = url
        .replace("ws://", "http://")
        .replace("wss://", "https://");
    let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SessionError::Fault(format!("http client: {}", e)))?;
    let resp: serde_json::Value = client
        .get(&version_url)
        .send()
        .await
        .map_err(|e| SessionError::Fault(format!("remote browser unreachable: {}", e)))?
        .json()
        .await
        .map_err(|e| SessionError::Fault(format!("bad browser version info: {}", e)))?;

    resp.get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| SessionError::Fault("no webSocketDebuggerUrl in response".to_string()))
}

/// One browser + page pair driven over CDP.
pub struct ChromeSession {
    worker_id: usize,
    config: BrowserEngineConfig,
    browser: Option<Browser>,
    page: Option<Page>,
    handler: Option<JoinHandle<()>>,
    alive: Arc<AtomicBool>,
    download_dir: TempDir,
    will_begin: EventStream<EventDownloadWillBegin>,
    progress: EventStream<EventDownloadProgress>,
}

impl ChromeSession {
    /// Launch (or connect to) a browser and prepare a download-capturing page.
    pub async fn open(config: BrowserEngineConfig, worker_id: usize) -> Result<Self, SessionError> {
        let alive = Arc::new(AtomicBool::new(true));
        let timeout = config.navigation_timeout();

        let (mut browser, handler) = if let Some(ref remote) = config.remote_url {
            info!("[worker {}] Connecting to remote browser at {}", worker_id, remote);
            let ws_url = remote_ws_url(remote, timeout).await?;
            let handler_config = chromiumoxide::handler::HandlerConfig {
                request_timeout: timeout,
                ..Default::default()
            };
            Browser::connect_with_config(ws_url, handler_config)
                .await
                .map_err(|e| SessionError::Fault(format!("connect failed: {}", e)))?
        } else {
            info!(
                "[worker {}] Launching browser (headless={})",
                worker_id, config.headless
            );
            let mut builder = BrowserConfig::builder()
                .chrome_executable(find_chrome(&config)?)
                .request_timeout(timeout)
                .window_size(config.viewport_width, config.viewport_height);

            // with_head means NOT headless
            if !config.headless {
                builder = builder.with_head();
            }

            builder = builder
                .arg("--disable-dev-shm-usage")
                .arg("--no-first-run")
                .arg("--no-default-browser-check")
                .arg("--disable-background-networking")
                .arg("--disable-sync")
                .arg("--disable-translate")
                .arg("--no-sandbox")
                .arg("--disable-gpu");

            for arg in &config.chrome_args {
                builder = builder.arg(arg);
            }

            let browser_config = builder
                .build()
                .map_err(|e| SessionError::Fault(format!("bad browser config: {}", e)))?;

            Browser::launch(browser_config)
                .await
                .map_err(|e| SessionError::Fault(format!("launch failed: {}", e)))?
        };

        let handler = spawn_handler(handler, alive.clone());

        let download_dir = tempfile::Builder::new()
            .prefix(&format!("ineacquire-w{}-", worker_id))
            .tempdir()
            .map_err(|e| SessionError::Fault(format!("download dir: {}", e)))?;

        let setup = async {
            let behavior = SetDownloadBehaviorParams::builder()
                .behavior(SetDownloadBehaviorBehavior::AllowAndName)
                .download_path(download_dir.path().to_string_lossy().to_string())
                .events_enabled(true)
                .build()
                .map_err(|e| SessionError::Fault(e.to_string()))?;
            browser
                .execute(behavior)
                .await
                .map_err(|e| SessionError::Fault(format!("setDownloadBehavior: {}", e)))?;

            let progress = browser
                .event_listener::<EventDownloadProgress>()
                .await
                .map_err(|e| SessionError::Fault(format!("progress listener: {}", e)))?;

            let page = browser
                .new_page("about:blank")
                .await
                .map_err(|e| SessionError::Fault(format!("new page: {}", e)))?;
            let will_begin = page
                .event_listener::<EventDownloadWillBegin>()
                .await
                .map_err(|e| SessionError::Fault(format!("download listener: {}", e)))?;

            page.execute(SetUserAgentOverrideParams::new(config.user_agent.clone()))
                .await
                .map_err(|e| SessionError::Fault(format!("user agent: {}", e)))?;
            page.execute(SetDeviceMetricsOverrideParams::new(
                config.viewport_width as i64,
                config.viewport_height as i64,
                1.0,
                false,
            ))
            .await
            .map_err(|e| SessionError::Fault(format!("viewport: {}", e)))?;

            Ok::<_, SessionError>((page, will_begin, progress))
        };

        match setup.await {
            Ok((page, will_begin, progress)) => {
                debug!("[worker {}] Session ready", worker_id);
                Ok(Self {
                    worker_id,
                    config,
                    browser: Some(browser),
                    page: Some(page),
                    handler: Some(handler),
                    alive,
                    download_dir,
                    will_begin,
                    progress,
                })
            }
            Err(e) => {
                let _ = browser.close().await;
                handler.abort();
                Err(e)
            }
        }
    }

    fn page(&self) -> Result<&Page, SessionError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SessionError::Fault("browser connection lost".to_string()));
        }
        self.page
            .as_ref()
            .ok_or_else(|| SessionError::Fault("session already closed".to_string()))
    }

    /// Turn a CDP error into `fallback`, unless the browser is gone.
    fn classify(&self, fallback: SessionError) -> SessionError {
        if self.alive.load(Ordering::SeqCst) {
            fallback
        } else {
            SessionError::Fault("browser connection lost".to_string())
        }
    }

    async fn wait_for_page_ready(&self, page: &Page) {
        match tokio::time::timeout(
            self.config.navigation_timeout(),
            page.evaluate(WAIT_FOR_READY_SCRIPT.to_string()),
        )
        .await
        {
            Ok(Ok(result)) => {
                let state: String = result
                    .into_value()
                    .unwrap_or_else(|_| "unknown".to_string());
                debug!("Page ready state: {}", state);
            }
            Ok(Err(e)) => debug!("Could not check ready state: {}", e),
            Err(_) => warn!("Timeout waiting for page ready state"),
        }
    }

    /// Drop buffered download announcements left over from earlier attempts.
    fn drain_stale_events(&mut self) {
        while let Some(Some(ev)) = self.will_begin.next().now_or_never() {
            debug!("Discarding stale download {}", ev.guid);
        }
        while let Some(Some(_)) = self.progress.next().now_or_never() {}
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        let page = self.page()?;
        info!("[worker {}] Navigating to {}", self.worker_id, url);

        let nav_params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| SessionError::Navigation(format!("invalid URL {}: {}", url, e)))?;

        let response = tokio::time::timeout(self.config.navigation_timeout(), page.execute(nav_params))
            .await
            .map_err(|_| {
                SessionError::Navigation(format!(
                    "timed out after {}s for {}",
                    self.config.timeout, url
                ))
            })?
            .map_err(|e| self.classify(SessionError::Navigation(format!("{}: {}", url, e))))?;

        if let Some(ref error_text) = response.result.error_text {
            return Err(SessionError::Navigation(format!("{}: {}", url, error_text)));
        }

        self.wait_for_page_ready(page).await;
        tokio::time::sleep(SETTLE_AFTER_LOAD).await;
        Ok(())
    }

    async fn probe_frames(
        &mut self,
        locator: &ControlLocator,
    ) -> Result<Option<ControlHandle>, SessionError> {
        let page = self.page()?;
        let script = probe_script(locator, self.config.frame_depth);

        match page.evaluate(script).await {
            Ok(result) => {
                let value = result
                    .into_value::<serde_json::Value>()
                    .unwrap_or(serde_json::Value::Null);
                Ok(parse_probe_result(locator, value))
            }
            Err(e) => {
                // Execution contexts are torn down while frames load; retry on next poll.
                debug!("Probe for '{}' failed: {}", locator.name, e);
                if self.alive.load(Ordering::SeqCst) {
                    Ok(None)
                } else {
                    Err(SessionError::Fault("browser connection lost".to_string()))
                }
            }
        }
    }

    async fn click(&mut self, handle: &ControlHandle) -> Result<(), SessionError> {
        let page = self.page()?;
        debug!(
            "[worker {}] Clicking '{}' in frame {:?}",
            self.worker_id, handle.locator, handle.frame_path
        );

        let clicked = page
            .evaluate(click_script(handle))
            .await
            .map_err(|_| self.classify(SessionError::ControlNotFound(handle.locator.clone())))?
            .into_value::<bool>()
            .unwrap_or(false);

        if clicked {
            Ok(())
        } else {
            Err(SessionError::ControlNotFound(handle.locator.clone()))
        }
    }

    async fn await_download(&mut self, timeout: Duration) -> Result<DownloadedFile, SessionError> {
        self.page()?;
        let dir = self.download_dir.path().to_path_buf();
        let worker_id = self.worker_id;
        let will_begin = &mut self.will_begin;
        let progress = &mut self.progress;

        let wait = async {
            let mut target: Option<(String, String)> = None;
            // Progress can be observed before the page-level announcement.
            let mut finished: HashMap<String, DownloadProgressState> = HashMap::new();

            loop {
                if let Some((ref guid, ref name)) = target {
                    match finished.get(guid) {
                        Some(DownloadProgressState::Completed) => {
                            return Ok((guid.clone(), name.clone()));
                        }
                        Some(DownloadProgressState::Canceled) => {
                            return Err(SessionError::DownloadTimeout(timeout));
                        }
                        _ => {}
                    }
                }

                tokio::select! {
                    Some(ev) = will_begin.next(), if target.is_none() => {
                        debug!(
                            "[worker {}] Download started: {} ({})",
                            worker_id, ev.suggested_filename, ev.guid
                        );
                        target = Some((ev.guid.clone(), ev.suggested_filename.clone()));
                    }
                    Some(ev) = progress.next() => {
                        if !matches!(ev.state, DownloadProgressState::InProgress) {
                            finished.insert(ev.guid.clone(), ev.state.clone());
                        }
                    }
                    else => {
                        return Err(SessionError::Fault("download event stream closed".to_string()));
                    }
                }
            }
        };

        let (guid, suggested) = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SessionError::DownloadTimeout(timeout))??;

        // allowAndName stores the file under its guid.
        let path = dir.join(&guid);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| SessionError::Fault(format!("reading {}: {}", path.display(), e)))?;
        let _ = tokio::fs::remove_file(&path).await;

        info!(
            "[worker {}] Downloaded {} ({} bytes)",
            self.worker_id,
            suggested,
            bytes.len()
        );

        Ok(DownloadedFile {
            suggested_filename: (!suggested.is_empty()).then_some(suggested),
            bytes,
        })
    }

    async fn reset(&mut self) -> Result<(), SessionError> {
        let page = self.page()?;
        page.goto("about:blank")
            .await
            .map_err(|e| self.classify(SessionError::Navigation(format!("reset: {}", e))))?;
        if let Err(e) = page.execute(ClearBrowserCookiesParams::default()).await {
            debug!("Clearing cookies failed: {}", e);
        }
        if let Err(e) = page.execute(ClearBrowserCacheParams::default()).await {
            debug!("Clearing cache failed: {}", e);
        }
        self.drain_stale_events();
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(page) = self.page.take() {
            let _ = page.close().await;
        }
        if let Some(mut browser) = self.browser.take() {
            debug!("[worker {}] Closing browser", self.worker_id);
            if self.config.remote_url.is_none() {
                let _ = browser.close().await;
            }
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
    }
}

/// Opens a fresh [`ChromeSession`] per worker.
pub struct ChromeSessionFactory {
    config: BrowserEngineConfig,
}

impl ChromeSessionFactory {
    pub fn new(config: BrowserEngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    async fn create(&self, worker_id: usize) -> Result<Box<dyn BrowserSession>, SessionError> {
        let session = ChromeSession::open(self.config.clone(), worker_id).await?;
        Ok(Box::new(session))
    }
}
