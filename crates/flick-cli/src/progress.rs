//! Terminal progress display

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}";
const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {bytes} {msg}";

/// Progress bar for one transfer
///
/// Starts as a spinner when the size is unknown and switches to a bar once a
/// total is known.
pub struct TransferProgress {
    bar: ProgressBar,
    sized: bool,
}

impl TransferProgress {
    /// Create a display; `total` of `None` or zero shows a spinner
    pub fn new(total: Option<u64>, message: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.enable_steady_tick(Duration::from_millis(120));
        let mut progress = Self { bar, sized: false };
        progress.apply_style(SPINNER_TEMPLATE);
        progress.set_message(message);
        if let Some(total) = total {
            progress.set_total(total);
        }
        progress
    }

    fn apply_style(&mut self, template: &str) {
        if let Ok(style) = ProgressStyle::with_template(template) {
            self.bar.set_style(style.progress_chars("=>-"));
        }
    }

    /// Switch to a sized bar
    pub fn set_total(&mut self, total: u64) {
        if total == 0 || self.sized {
            return;
        }
        self.bar.set_length(total);
        self.apply_style(BAR_TEMPLATE);
        self.sized = true;
    }

    /// Move to `bytes`
    pub fn update(&self, bytes: u64) {
        self.bar.set_position(bytes);
    }

    /// Replace the trailing text
    pub fn set_message(&self, message: &str) {
        self.bar.set_message(message.replace('\n', " "));
    }

    /// Stop with a success line
    pub fn finish_with_message(&self, message: &str) {
        self.bar.finish_with_message(message.replace('\n', " "));
    }

    /// Stop with a failure line, leaving the bar where it was
    pub fn abandon_with_message(&self, message: &str) {
        self.bar.abandon_with_message(message.replace('\n', " "));
    }
}

/// Format a byte count with binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
