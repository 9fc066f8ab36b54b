//! Human-readable rendering of a run summary.

use std::fmt::Write;

use chrono::Local;

use super::RunSummary;
use crate::download::TaskOutcome;

pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.2} GB", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:.2} MB", bytes as f64 / 1_000_000.0)
    } else if bytes >= 1_000 {
        format!("{:.2} KB", bytes as f64 / 1_000.0)
    } else {
        format!("{} bytes", bytes)
    }
}

fn format_ms(ms: u64) -> String {
    if ms >= 60_000 {
        format!("{}m {:02}s", ms / 60_000, (ms % 60_000) / 1000)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

fn outcome_line(out: &mut String, o: &TaskOutcome) {
    let attempts = if o.attempts == 1 {
        "1 attempt".to_string()
    } else {
        format!("{} attempts", o.attempts)
    };

    if o.is_success() {
        let _ = writeln!(
            out,
            "  [OK]   {:<24} {} ({}, {}, {})",
            o.dataset_id,
            o.display_name,
            attempts,
            format_ms(o.duration_ms),
            format_bytes(o.bytes.unwrap_or(0)),
        );
        if let Some(ref path) = o.saved_path {
            let _ = writeln!(out, "         -> {}", path);
        }
    } else {
        let kind = o
            .error_kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        let _ = writeln!(
            out,
            "  [FAIL] {:<24} {} ({}, {})",
            o.dataset_id, o.display_name, kind, attempts
        );
        if let Some(ref msg) = o.error_message {
            let _ = writeln!(out, "         {}", msg);
        }
    }
}

/// Text rendering of a summary: totals, then successes, then failures.
pub fn render_text(summary: &RunSummary) -> String {
    let rule = "=".repeat(70);
    let mut out = String::new();

    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "DATASET FETCH REPORT");
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(
        out,
        "Started:      {}",
        summary.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(
        out,
        "Finished:     {}",
        summary.finished_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(out, "Duration:     {}", format_ms(summary.timings.total_ms));
    let _ = writeln!(out, "Workers:      {}", summary.workers);
    let _ = writeln!(out);
    let _ = writeln!(out, "Total:        {}", summary.total);
    let _ = writeln!(out, "Succeeded:    {}", summary.succeeded);
    let _ = writeln!(out, "Failed:       {}", summary.failed);
    let _ = writeln!(out, "Success rate: {:.2}%", summary.success_rate);
    let _ = writeln!(out, "Retried:      {}", summary.retried);
    let _ = writeln!(out, "Downloaded:   {}", format_bytes(summary.total_bytes));
    let _ = writeln!(
        out,
        "Task time:    mean {}, min {}, max {}",
        format_ms(summary.timings.mean_task_ms),
        format_ms(summary.timings.min_task_ms),
        format_ms(summary.timings.max_task_ms)
    );
    if summary.cancelled {
        let _ = writeln!(out, "Run deadline exceeded: unfinished datasets were cancelled");
    }

    if summary.succeeded > 0 {
        let _ = writeln!(out);
        let _ = writeln!(out, "SUCCEEDED ({})", summary.succeeded);
        let _ = writeln!(out, "{}", "-".repeat(70));
        for o in summary.successes() {
            outcome_line(&mut out, o);
        }
    }

    if summary.failed > 0 {
        let _ = writeln!(out);
        let _ = writeln!(out, "FAILED ({})", summary.failed);
        let _ = writeln!(out, "{}", "-".repeat(70));
        for o in summary.failures() {
            outcome_line(&mut out, o);
        }
    }

    let _ = writeln!(out, "{}", rule);
    out
}
