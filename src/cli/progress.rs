//! Multi-progress display for concurrent browser sessions.

use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::Mutex;

/// One spinner per worker plus a summary bar.
pub struct FetchProgress {
    multi: MultiProgress,
    slots: Mutex<Vec<ProgressBar>>,
    summary_bar: ProgressBar,
}

fn idle_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("  {spinner:.dim} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn busy_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("  {spinner:.cyan} {wide_msg} {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

impl FetchProgress {
    pub fn new(num_workers: usize, total: u64) -> Self {
        let multi = MultiProgress::new();

        let summary_bar = multi.add(ProgressBar::new(total));
        summary_bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓░"),
        );
        summary_bar.set_message("Fetching");

        let slots = (0..num_workers)
            .map(|worker_id| {
                let bar = multi.add(ProgressBar::new_spinner());
                bar.set_style(idle_style());
                bar.set_message(format!("session {}: starting", worker_id));
                bar
            })
            .collect();

        Self {
            multi,
            slots: Mutex::new(slots),
            summary_bar,
        }
    }

    pub async fn set_message(&self, worker_id: usize, message: String) {
        let slots = self.slots.lock().await;
        if let Some(bar) = slots.get(worker_id) {
            bar.set_message(message);
        }
    }

    pub async fn start_task(&self, worker_id: usize, name: &str, attempt: u32) {
        let slots = self.slots.lock().await;
        if let Some(bar) = slots.get(worker_id) {
            bar.reset_elapsed();
            bar.set_style(busy_style());
            let label = truncate_name(name, 45);
            if attempt > 1 {
                bar.set_message(format!("{} (attempt {})", label, attempt));
            } else {
                bar.set_message(label);
            }
            bar.enable_steady_tick(Duration::from_millis(100));
        }
    }

    pub async fn finish_task(&self, worker_id: usize) {
        {
            let slots = self.slots.lock().await;
            if let Some(bar) = slots.get(worker_id) {
                bar.disable_steady_tick();
                bar.set_style(idle_style());
                bar.set_message("idle");
            }
        }
        self.summary_bar.inc(1);
    }

    pub fn set_summary(&self, succeeded: usize, failed: usize) {
        self.summary_bar
            .set_message(format!("Succeeded: {} | Failed: {}", succeeded, failed));
    }

    /// Print without corrupting the bars.
    pub fn println(&self, message: &str) {
        let _ = self.multi.println(message);
    }

    pub async fn finish(&self) {
        let slots = self.slots.lock().await;
        for bar in slots.iter() {
            bar.finish_and_clear();
        }
        self.summary_bar.finish_and_clear();
    }
}

/// Shorten a dataset name for display.
fn truncate_name(name: &str, max_chars: usize) -> String {
    if name.chars().count() <= max_chars {
        return name.to_string();
    }
    let kept: String = name.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_name() {
        assert_eq!(truncate_name("Aire", 10), "Aire");
        assert_eq!(truncate_name("Calidad del aire diaria", 10), "Calidad...");
        // multi-byte characters are not split
        assert_eq!(truncate_name("ñandú ñandú", 8), "ñandú...");
    }
}
