//! Configuration management.
//!
//! Settings are resolved once at startup, lowest precedence first:
//! built-in defaults, an optional TOML/JSON config file, environment
//! variables (after `.env` is loaded), then command-line flags. The result
//! is validated and shared read-only for the rest of the run.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::browser::{BrowserEngineConfig, DEFAULT_USER_AGENT};
use crate::download::{DownloadFlow, ExecutorConfig, CONTROL_POLL_INTERVAL};
use crate::pool::PoolConfig;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILENAME: &str = "ineacquire.toml";

/// Flag columns removed by default.
pub const DEFAULT_STRIP_COLUMNS: &[&str] = &["Flag Codes", "Flags", "flag_codes"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: impl ToString, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Effective settings for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    /// Dataset catalog (JSON).
    pub catalog_path: PathBuf,
    /// Root for dated run directories.
    pub output_dir: PathBuf,
    /// Worker pool size.
    pub max_sessions: usize,
    /// Per-attempt download wait ceiling.
    pub download_timeout_ms: u64,
    /// Pause between tasks on a session, also used before retries.
    pub inter_task_delay_ms: f64,
    /// Only the first N catalog entries, for test runs.
    pub max_datasets: Option<usize>,
    pub headless: bool,
    pub max_attempts: u32,
    /// How long to poll for each control before giving up.
    pub control_poll_ms: u64,
    /// Nested frame levels searched for controls.
    pub frame_depth: usize,
    pub session_create_retries: u32,
    /// Overall run deadline.
    pub run_deadline_secs: Option<u64>,
    /// Portal language query parameter; `None` leaves URLs untouched.
    pub language: Option<String>,
    /// Remote DevTools endpoint instead of launching browsers.
    pub browser_url: Option<String>,
    pub chrome_path: Option<PathBuf>,
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Columns removed by `strip-columns`.
    pub strip_columns: Vec<String>,
    pub flow: DownloadFlow,
    /// Config file these settings were read from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("config/catalog.json"),
            output_dir: PathBuf::from("data"),
            max_sessions: 3,
            download_timeout_ms: 60_000,
            inter_task_delay_ms: 1_000.0,
            max_datasets: None,
            headless: true,
            max_attempts: 2,
            control_poll_ms: 15_000,
            frame_depth: 4,
            session_create_retries: 2,
            run_deadline_secs: None,
            language: Some("es".to_string()),
            browser_url: None,
            chrome_path: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            viewport_width: 1920,
            viewport_height: 1080,
            strip_columns: DEFAULT_STRIP_COLUMNS.iter().map(|s| s.to_string()).collect(),
            flow: DownloadFlow::default(),
            source_path: None,
        }
    }
}

/// Configuration file structure. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inter_task_delay_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_datasets: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headless: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_poll_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_depth: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_create_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_deadline_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrome_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<DownloadFlow>,
}

impl FileConfig {
    /// Load a config file; the format follows the extension (TOML unless `.json`).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_err = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents).map_err(|e| parse_err(e.to_string())),
            _ => toml::from_str(&contents).map_err(|e| parse_err(e.to_string())),
        }
    }

    /// Resolve a path from the file relative to the file's directory.
    fn resolve(base_dir: Option<&Path>, path: PathBuf) -> PathBuf {
        match base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }

    pub fn apply_to_settings(self, settings: &mut Settings, base_dir: Option<&Path>) {
        if let Some(v) = self.catalog_path {
            settings.catalog_path = Self::resolve(base_dir, v);
        }
        if let Some(v) = self.output_dir {
            settings.output_dir = Self::resolve(base_dir, v);
        }
        if let Some(v) = self.max_sessions {
            settings.max_sessions = v;
        }
        if let Some(v) = self.download_timeout_ms {
            settings.download_timeout_ms = v;
        }
        if let Some(v) = self.inter_task_delay_ms {
            settings.inter_task_delay_ms = v;
        }
        if self.max_datasets.is_some() {
            settings.max_datasets = self.max_datasets;
        }
        if let Some(v) = self.headless {
            settings.headless = v;
        }
        if let Some(v) = self.max_attempts {
            settings.max_attempts = v;
        }
        if let Some(v) = self.control_poll_ms {
            settings.control_poll_ms = v;
        }
        if let Some(v) = self.frame_depth {
            settings.frame_depth = v;
        }
        if let Some(v) = self.session_create_retries {
            settings.session_create_retries = v;
        }
        if self.run_deadline_secs.is_some() {
            settings.run_deadline_secs = self.run_deadline_secs;
        }
        if let Some(v) = self.language {
            settings.language = non_empty(v);
        }
        if self.browser_url.is_some() {
            settings.browser_url = self.browser_url;
        }
        if let Some(v) = self.chrome_path {
            settings.chrome_path = Some(v);
        }
        if let Some(v) = self.user_agent {
            settings.user_agent = v;
        }
        if let Some(v) = self.viewport_width {
            settings.viewport_width = v;
        }
        if let Some(v) = self.viewport_height {
            settings.viewport_height = v;
        }
        if let Some(v) = self.strip_columns {
            settings.strip_columns = v;
        }
        if let Some(v) = self.flow {
            settings.flow = v;
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, value, e.to_string()))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected true or false")),
    }
}

fn parse_seconds_as_ms(key: &str, value: &str) -> Result<f64, ConfigError> {
    let secs: f64 = parse_num(key, value)?;
    Ok(secs * 1000.0)
}

impl Settings {
    /// Defaults, then the config file, then the process environment.
    ///
    /// With no explicit path, `ineacquire.toml` in the working directory is
    /// used when present.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        let path = match config_path {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let candidate = PathBuf::from(DEFAULT_CONFIG_FILENAME);
                candidate.exists().then_some(candidate)
            }
        };

        if let Some(path) = path {
            debug!("Loading config from {}", path.display());
            let file = FileConfig::load(&path)?;
            let base_dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            file.apply_to_settings(&mut settings, base_dir);
            settings.source_path = Some(path);
        }

        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Overlay environment-style variables read through `lookup`.
    ///
    /// Legacy second-based names apply only when their millisecond
    /// counterparts are absent.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("CATALOG_PATH") {
            self.catalog_path = PathBuf::from(v);
        }
        if let Some(v) = get("OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }

        if let Some(v) = get("MAX_CONCURRENT_SESSIONS") {
            self.max_sessions = parse_num("MAX_CONCURRENT_SESSIONS", &v)?;
        } else if let Some(v) = get("MAX_CONCURRENT_BROWSERS") {
            self.max_sessions = parse_num("MAX_CONCURRENT_BROWSERS", &v)?;
        }

        if let Some(v) = get("DOWNLOAD_TIMEOUT_MS") {
            self.download_timeout_ms = parse_num("DOWNLOAD_TIMEOUT_MS", &v)?;
        } else if let Some(v) = get("DOWNLOAD_TIMEOUT") {
            self.download_timeout_ms = parse_seconds_as_ms("DOWNLOAD_TIMEOUT", &v)? as u64;
        }

        if let Some(v) = get("INTER_TASK_DELAY_MS") {
            self.inter_task_delay_ms = parse_num("INTER_TASK_DELAY_MS", &v)?;
        } else if let Some(v) = get("DELAY_BETWEEN_DOWNLOADS") {
            self.inter_task_delay_ms = parse_seconds_as_ms("DELAY_BETWEEN_DOWNLOADS", &v)?;
        }

        if let Some(v) = get("MAX_DATASETS") {
            self.max_datasets = Some(parse_num("MAX_DATASETS", &v)?);
        }
        if let Some(v) = get("HEADLESS") {
            self.headless = parse_bool("HEADLESS", &v)?;
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            self.max_attempts = parse_num("MAX_ATTEMPTS", &v)?;
        } else if let Some(v) = get("MAX_RETRIES") {
            self.max_attempts = parse_num("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("CONTROL_POLL_MS") {
            self.control_poll_ms = parse_num("CONTROL_POLL_MS", &v)?;
        }
        if let Some(v) = get("RUN_DEADLINE_SECS") {
            self.run_deadline_secs = Some(parse_num("RUN_DEADLINE_SECS", &v)?);
        }
        if let Some(v) = lookup("PORTAL_LANGUAGE") {
            self.language = non_empty(v);
        }
        if let Some(v) = get("BROWSER_URL") {
            self.browser_url = Some(v);
        }
        if let Some(v) = get("CHROME_PATH") {
            self.chrome_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = get("VIEWPORT_WIDTH") {
            self.viewport_width = parse_num("VIEWPORT_WIDTH", &v)?;
        }
        if let Some(v) = get("VIEWPORT_HEIGHT") {
            self.viewport_height = parse_num("VIEWPORT_HEIGHT", &v)?;
        }

        Ok(())
    }

    /// Reject settings the run cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::invalid("max_sessions", 0, "need at least one session"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", 0, "need at least one attempt"));
        }
        if self.download_timeout_ms == 0 {
            return Err(ConfigError::invalid("download_timeout_ms", 0, "must be positive"));
        }
        if !self.inter_task_delay_ms.is_finite() || self.inter_task_delay_ms < 0.0 {
            return Err(ConfigError::invalid(
                "inter_task_delay_ms",
                self.inter_task_delay_ms,
                "must be a non-negative number",
            ));
        }
        if self.control_poll_ms == 0 || self.control_poll_ms >= self.download_timeout_ms {
            return Err(ConfigError::invalid(
                "control_poll_ms",
                self.control_poll_ms,
                format!(
                    "must be positive and shorter than the download timeout ({} ms)",
                    self.download_timeout_ms
                ),
            ));
        }
        if self.viewport_width == 0 || self.viewport_height == 0 {
            return Err(ConfigError::invalid(
                "viewport",
                format!("{}x{}", self.viewport_width, self.viewport_height),
                "must be non-zero",
            ));
        }
        if self.flow.steps.is_empty() {
            return Err(ConfigError::invalid("flow", "[]", "needs at least one step"));
        }
        Ok(())
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    pub fn inter_task_delay(&self) -> Duration {
        Duration::from_secs_f64(self.inter_task_delay_ms.max(0.0) / 1000.0)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_attempts: self.max_attempts,
            download_timeout: self.download_timeout(),
            retry_delay: self.inter_task_delay(),
            control_poll_window: Duration::from_millis(self.control_poll_ms),
            control_poll_interval: CONTROL_POLL_INTERVAL,
            language: self.language.clone(),
            free_session_faults: 1,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_sessions: self.max_sessions,
            inter_task_delay: self.inter_task_delay(),
            run_deadline: self.run_deadline(),
            session_create_retries: self.session_create_retries,
        }
    }

    pub fn engine_config(&self) -> BrowserEngineConfig {
        BrowserEngineConfig {
            headless: self.headless,
            remote_url: self.browser_url.clone(),
            executable: self.chrome_path.clone(),
            user_agent: self.user_agent.clone(),
            viewport_width: self.viewport_width,
            viewport_height: self.viewport_height,
            // CDP requests must outlive the download wait.
            timeout: (self.download_timeout_ms / 1000).max(30),
            frame_depth: self.frame_depth,
            chrome_args: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.max_sessions, 3);
        assert_eq!(settings.download_timeout(), Duration::from_secs(60));
        assert_eq!(settings.inter_task_delay(), Duration::from_secs(1));
        assert_eq!(settings.max_attempts, 2);
        assert!(settings.headless);
        assert!(settings.run_deadline().is_none());
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings
            .apply_env(env(&[
                ("MAX_CONCURRENT_SESSIONS", "5"),
                ("DOWNLOAD_TIMEOUT_MS", "30000"),
                ("INTER_TASK_DELAY_MS", "250.5"),
                ("MAX_DATASETS", "10"),
                ("HEADLESS", "false"),
                ("MAX_ATTEMPTS", "3"),
                ("RUN_DEADLINE_SECS", "600"),
            ]))
            .unwrap();
        assert_eq!(settings.max_sessions, 5);
        assert_eq!(settings.download_timeout_ms, 30_000);
        assert_eq!(settings.inter_task_delay_ms, 250.5);
        assert_eq!(settings.max_datasets, Some(10));
        assert!(!settings.headless);
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.run_deadline(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_legacy_env_names() {
        let mut settings = Settings::default();
        settings
            .apply_env(env(&[
                ("MAX_CONCURRENT_BROWSERS", "4"),
                ("DOWNLOAD_TIMEOUT", "90"),
                ("DELAY_BETWEEN_DOWNLOADS", "1.5"),
            ]))
            .unwrap();
        assert_eq!(settings.max_sessions, 4);
        assert_eq!(settings.download_timeout_ms, 90_000);
        assert_eq!(settings.inter_task_delay_ms, 1_500.0);

        // the millisecond names win
        let mut settings = Settings::default();
        settings
            .apply_env(env(&[("DOWNLOAD_TIMEOUT", "90"), ("DOWNLOAD_TIMEOUT_MS", "1000")]))
            .unwrap();
        assert_eq!(settings.download_timeout_ms, 1_000);
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(env(&[("MAX_ATTEMPTS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "MAX_ATTEMPTS"));

        let err = settings.apply_env(env(&[("HEADLESS", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("HEADLESS"));
    }

    #[test]
    fn test_empty_language_disables_parameter() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[("PORTAL_LANGUAGE", "")])).unwrap();
        assert_eq!(settings.language, None);
    }

    #[test]
    fn test_validate_rejects_zero_and_long_poll() {
        let mut settings = Settings {
            max_sessions: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        settings.max_sessions = 2;
        settings.control_poll_ms = settings.download_timeout_ms;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_toml_file_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ineacquire.toml");
        std::fs::write(
            &path,
            r##"
            catalog_path = "catalog.json"
            output_dir = "/var/data"
            max_sessions = 2
            strip_columns = ["Flags"]

            [flow]
            settle_ms = 500

            [[flow.steps]]
            name = "button"
            selectors = ["#download"]
            "##,
        )
        .unwrap();

        let file = FileConfig::load(&path).unwrap();
        let mut settings = Settings::default();
        file.apply_to_settings(&mut settings, Some(dir.path()));

        assert_eq!(settings.catalog_path, dir.path().join("catalog.json"));
        assert_eq!(settings.output_dir, PathBuf::from("/var/data"));
        assert_eq!(settings.max_sessions, 2);
        assert_eq!(settings.strip_columns, vec!["Flags".to_string()]);
        assert_eq!(settings.flow.steps.len(), 1);
        assert_eq!(settings.flow.settle_ms, 500);
    }

    #[test]
    fn test_unknown_file_key_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.toml");
        std::fs::write(&path, "max_sesions = 2\n").unwrap();
        assert!(matches!(
            FileConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_component_configs() {
        let settings = Settings {
            max_sessions: 4,
            run_deadline_secs: Some(30),
            ..Default::default()
        };
        assert_eq!(settings.pool_config().max_sessions, 4);
        assert_eq!(
            settings.pool_config().run_deadline,
            Some(Duration::from_secs(30))
        );
        assert_eq!(settings.executor_config().max_attempts, 2);
        assert_eq!(
            settings.executor_config().retry_delay,
            settings.pool_config().inter_task_delay
        );
        assert_eq!(settings.engine_config().timeout, 60);
    }
}
