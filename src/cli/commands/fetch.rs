//! Fetch command: run the session pool over the catalog.

use std::sync::Arc;

use anyhow::Context;
use console::style;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::browser::SessionFactory;
use crate::catalog::Catalog;
use crate::cli::icons::{dim_arrow, error, info, retry, success, warn};
use crate::cli::progress::FetchProgress;
use crate::config::Settings;
use crate::download::DownloadExecutor;
use crate::pool::{PoolEvent, WorkerPool};
use crate::report::{format_bytes, render_text, RunSummary, FETCH_REPORT_JSON, FETCH_REPORT_TXT};
use crate::storage::{FsSink, RunLayout};

/// Result of a fetch, for the caller to decide the exit status.
pub struct FetchRun {
    pub summary: RunSummary,
    pub layout: RunLayout,
}

#[cfg(feature = "browser")]
fn session_factory(settings: &Settings) -> anyhow::Result<Arc<dyn SessionFactory>> {
    Ok(Arc::new(crate::browser::ChromeSessionFactory::new(
        settings.engine_config(),
    )))
}

#[cfg(not(feature = "browser"))]
fn session_factory(_settings: &Settings) -> anyhow::Result<Arc<dyn SessionFactory>> {
    anyhow::bail!("this build has no browser backend; rebuild with --features browser")
}

/// Cancel the run on Ctrl-C; in-flight datasets are reported as cancelled.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{} Interrupted, cancelling in-flight downloads...",
                warn()
            );
            cancel.cancel();
        }
    });
}

/// Download every selected catalog dataset and write the run reports.
pub async fn cmd_fetch(settings: Arc<Settings>, show_progress: bool) -> anyhow::Result<FetchRun> {
    let catalog = Catalog::load(&settings.catalog_path).context("failed to load dataset catalog")?;
    let selected = catalog.select(settings.max_datasets);
    if selected.len() < catalog.len() {
        println!(
            "{} Limiting run to the first {} of {} datasets",
            warn(),
            selected.len(),
            catalog.len()
        );
    }

    let layout = RunLayout::today(&settings.output_dir);
    let sink = Arc::new(FsSink::new(layout.clone()).context("failed to prepare output directory")?);
    let factory = session_factory(&settings)?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PoolEvent>();
    let executor = DownloadExecutor::new(
        settings.executor_config(),
        Arc::new(settings.flow.clone()),
        sink,
    )
    .with_events(event_tx.clone());
    let pool = WorkerPool::new(settings.pool_config(), Arc::new(executor), factory)
        .with_events(event_tx);

    let workers = pool.worker_count(selected.len());
    println!(
        "{} Fetching {} datasets with {} browser sessions into {}",
        info(),
        selected.len(),
        workers,
        layout.root.display()
    );

    let progress_display = if show_progress {
        Some(Arc::new(FetchProgress::new(workers, selected.len() as u64)))
    } else {
        None
    };

    let progress_clone = progress_display.clone();
    let event_handler = tokio::spawn(async move {
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        while let Some(event) = event_rx.recv().await {
            match event {
                PoolEvent::WorkerReady { worker_id } => {
                    if let Some(ref progress) = progress_clone {
                        progress.set_message(worker_id, "idle".to_string()).await;
                    }
                }
                PoolEvent::TaskStarted {
                    worker_id,
                    display_name,
                    attempt,
                    ..
                } => {
                    if let Some(ref progress) = progress_clone {
                        progress.start_task(worker_id, &display_name, attempt).await;
                    }
                }
                PoolEvent::AttemptFailed {
                    dataset_id,
                    attempt,
                    error,
                    ..
                } => {
                    let line = format!(
                        "  {} {} attempt {} failed: {}",
                        retry(),
                        dataset_id,
                        attempt,
                        error
                    );
                    match progress_clone {
                        Some(ref progress) => progress.println(&line),
                        None => tracing::info!("{}", line.trim()),
                    }
                }
                PoolEvent::TaskFinished { worker_id, outcome } => {
                    if outcome.is_success() {
                        succeeded += 1;
                    } else {
                        failed += 1;
                        let line = format!(
                            "{} {} ({}): {}",
                            error(),
                            outcome.dataset_id,
                            outcome.display_name,
                            outcome
                                .error_kind
                                .map(|k| k.to_string())
                                .unwrap_or_default()
                        );
                        match progress_clone {
                            Some(ref progress) => progress.println(&line),
                            None => eprintln!("{}", line),
                        }
                    }
                    if let Some(ref progress) = progress_clone {
                        progress.set_summary(succeeded, failed);
                        progress.finish_task(worker_id).await;
                    }
                }
                PoolEvent::SessionReplaced { worker_id, reason } => {
                    let line = format!(
                        "  {} session {} replaced: {}",
                        warn(),
                        worker_id,
                        reason
                    );
                    match progress_clone {
                        Some(ref progress) => progress.println(&line),
                        None => eprintln!("{}", line),
                    }
                }
                PoolEvent::WorkerStopped { worker_id } => {
                    if let Some(ref progress) = progress_clone {
                        progress.set_message(worker_id, "stopped".to_string()).await;
                    }
                }
            }
        }
    });

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let summary = pool.run_with_cancel(selected, cancel).await?;
    // Closes the event channel.
    drop(pool);

    if let Err(e) = event_handler.await {
        tracing::warn!("Event handler task failed: {}", e);
    }
    if let Some(ref progress) = progress_display {
        progress.finish().await;
    }

    let json_path = layout
        .write_json_report(FETCH_REPORT_JSON, &summary)
        .context("failed to write fetch report")?;
    layout
        .write_text_report(FETCH_REPORT_TXT, &render_text(&summary))
        .context("failed to write text report")?;

    print_summary(&summary);
    println!("  {} Report: {}", dim_arrow(), json_path.display());

    Ok(FetchRun { summary, layout })
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} {}/{} datasets downloaded ({:.2}%, {})",
        if summary.is_clean() {
            success()
        } else {
            warn()
        },
        summary.succeeded,
        summary.total,
        summary.success_rate,
        format_bytes(summary.total_bytes)
    );
    if summary.retried > 0 {
        println!("  {} {} succeeded after a retry", style("↻").dim(), summary.retried);
    }
    if summary.cancelled {
        println!(
            "  {} Run cancelled before completion",
            warn()
        );
    }
    for failure in summary.failures() {
        println!(
            "  {} {} {} ({} attempts)",
            error(),
            failure.dataset_id,
            failure
                .error_kind
                .map(|k| k.to_string())
                .unwrap_or_default(),
            failure.attempts
        );
    }
}
