//! Terminal progress indicators for transfers
//!
//! One bar per transfer, driven from session state updates. A bar is cleared
//! (not left half full) when its transfer is abandoned.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::protocol::timeouts::PROGRESS_TICK_MS;

pub struct TransferBar {
    bar: ProgressBar,
    start_time: Instant,
}

impl TransferBar {
    pub fn new(verb: &str, name: &str, total: u64) -> Self {
        let bar = if total > 0 {
            ProgressBar::new(total)
        } else {
            ProgressBar::new_spinner()
        };
        bar.set_style(Self::style(total > 0));
        bar.set_message(format!("{} {}", verb, name));
        bar.enable_steady_tick(Duration::from_millis(PROGRESS_TICK_MS));
        Self {
            bar,
            start_time: Instant::now(),
        }
    }

    fn style(sized: bool) -> ProgressStyle {
        let template = if sized {
            "{spinner:.green} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})"
        } else {
            "{spinner:.green} {msg} {bytes}"
        };
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .progress_chars("=> ")
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
    }

    /// Update from a state snapshot; a download learns its size late.
    pub fn update(&self, done: u64, total: u64) {
        if total > 0 && self.bar.length() != Some(total) {
            self.bar.set_length(total);
            self.bar.set_style(Self::style(true));
        }
        self.bar.set_position(done);
    }

    pub fn finish_success(&self, bytes: u64) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            bytes as f64 / elapsed / 1_048_576.0
        } else {
            0.0
        };
        self.bar.finish_with_message(format!(
            "done {:.1} MB in {:.1}s ({:.1} MB/s)",
            bytes as f64 / 1_048_576.0,
            elapsed,
            throughput
        ));
    }

    pub fn abandon(&self) {
        self.bar.finish_and_clear();
    }
}

impl Drop for TransferBar {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}
