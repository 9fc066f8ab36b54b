//! CLI parser and command dispatch.

mod catalog;
mod config_cmd;
mod fetch;
mod pipeline;
mod transform;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use crate::config::Settings;

#[derive(Parser)]
#[command(name = "ineacquire")]
#[command(about = "Concurrent browser-driven acquisition of statistics portal datasets")]
#[command(version)]
pub struct Cli {
    /// Config file path (TOML or JSON)
    #[arg(short, long, global = true, env = "INEACQUIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

/// Overrides shared by `fetch` and `pipeline`. Unset flags leave the
/// configured value alone.
#[derive(Args, Debug, Default, Clone)]
pub struct FetchArgs {
    /// Dataset catalog JSON
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Root directory for dated run directories
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    /// Concurrent browser sessions
    #[arg(short = 's', long)]
    sessions: Option<usize>,
    /// Per-attempt download timeout in milliseconds
    #[arg(long)]
    download_timeout_ms: Option<u64>,
    /// Pause between tasks on one session, in milliseconds
    #[arg(long)]
    delay_ms: Option<f64>,
    /// Only fetch the first N catalog datasets
    #[arg(short = 'n', long)]
    max_datasets: Option<usize>,
    /// Attempts per dataset
    #[arg(long)]
    max_attempts: Option<u32>,
    /// How long to poll for each page control, in milliseconds
    #[arg(long)]
    control_poll_ms: Option<u64>,
    /// Stop the run after this many seconds
    #[arg(long)]
    deadline_secs: Option<u64>,
    /// Show browser windows
    #[arg(long)]
    headed: bool,
    /// Connect to a running browser's DevTools endpoint
    #[arg(long)]
    browser_url: Option<String>,
    /// Chrome/Chromium executable
    #[arg(long)]
    chrome_path: Option<PathBuf>,
    /// Portal language parameter (empty to disable)
    #[arg(long)]
    language: Option<String>,
    /// Show per-session progress
    #[arg(short = 'P', long)]
    progress: bool,
}

impl FetchArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(ref v) = self.catalog {
            settings.catalog_path = v.clone();
        }
        if let Some(ref v) = self.output_dir {
            settings.output_dir = v.clone();
        }
        if let Some(v) = self.sessions {
            settings.max_sessions = v;
        }
        if let Some(v) = self.download_timeout_ms {
            settings.download_timeout_ms = v;
        }
        if let Some(v) = self.delay_ms {
            settings.inter_task_delay_ms = v;
        }
        if let Some(v) = self.max_datasets {
            settings.max_datasets = Some(v);
        }
        if let Some(v) = self.max_attempts {
            settings.max_attempts = v;
        }
        if let Some(v) = self.control_poll_ms {
            settings.control_poll_ms = v;
        }
        if let Some(v) = self.deadline_secs {
            settings.run_deadline_secs = Some(v);
        }
        if self.headed {
            settings.headless = false;
        }
        if let Some(ref v) = self.browser_url {
            settings.browser_url = Some(v.clone());
        }
        if let Some(ref v) = self.chrome_path {
            settings.chrome_path = Some(v.clone());
        }
        if let Some(ref v) = self.language {
            settings.language = Some(v.trim().to_string()).filter(|l| !l.is_empty());
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Download every catalog dataset through a pool of browser sessions
    Fetch {
        #[command(flatten)]
        args: FetchArgs,
    },

    /// Rename downloaded files using a name-mapping JSON
    Standardize {
        /// Name mapping JSON
        #[arg(short, long)]
        mapping: PathBuf,
        /// Run directory (defaults to the newest one under the output dir)
        #[arg(long)]
        run_dir: Option<PathBuf>,
    },

    /// Remove flag columns from downloaded CSV files
    StripColumns {
        /// Run directory (defaults to the newest one under the output dir)
        #[arg(long)]
        run_dir: Option<PathBuf>,
        /// Column to remove (repeatable; replaces the configured list)
        #[arg(long = "column")]
        columns: Vec<String>,
    },

    /// Fetch, then standardize names, then strip flag columns
    Pipeline {
        #[command(flatten)]
        args: FetchArgs,
        /// Name mapping JSON; standardization is skipped without one
        #[arg(short, long)]
        mapping: Option<PathBuf>,
        /// Keep flag columns
        #[arg(long)]
        keep_flags: bool,
    },

    /// Validate and list a catalog
    Catalog {
        /// Catalog JSON (defaults to the configured one)
        catalog: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config {
        /// Output as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

fn exit_code(failed: usize) -> ExitCode {
    if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut settings =
        Settings::load(cli.config.as_deref()).context("failed to load configuration")?;

    if let Commands::Fetch { ref args } | Commands::Pipeline { ref args, .. } = cli.command {
        args.apply(&mut settings);
    }
    settings.validate().context("invalid configuration")?;
    let settings = Arc::new(settings);

    match cli.command {
        Commands::Fetch { args } => {
            let run = fetch::cmd_fetch(settings, args.progress).await?;
            Ok(exit_code(run.summary.failed))
        }
        Commands::Standardize { mapping, run_dir } => {
            transform::cmd_standardize(&settings, &mapping, run_dir.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::StripColumns { run_dir, columns } => {
            transform::cmd_strip_columns(&settings, run_dir.as_deref(), &columns).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Pipeline {
            args,
            mapping,
            keep_flags,
        } => {
            let failed =
                pipeline::cmd_pipeline(settings, args.progress, mapping.as_deref(), keep_flags)
                    .await?;
            Ok(exit_code(failed))
        }
        Commands::Catalog { catalog, json } => {
            let path = catalog.unwrap_or_else(|| settings.catalog_path.clone());
            catalog::cmd_catalog(&settings, &path, json).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config { json } => {
            config_cmd::cmd_config_show(&settings, json).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
