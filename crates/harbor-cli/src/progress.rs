//! Transfer progress display with progress bars.

use harbor_client::ProgressEvent;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

/// Progress bar bridging the client engine's events onto the terminal.
pub struct TransferBar {
    bar: ProgressBar,
    // Engine events may arrive before the total is known on resume.
    total_set: Mutex<bool>,
}

impl TransferBar {
    /// Create a bar for one transfer.
    #[must_use]
    pub fn new(filename: &str) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                .expect("Invalid progress bar template")
                .progress_chars("#>-"),
        );
        bar.set_message(format!("Transferring: {filename}"));
        Self {
            bar,
            total_set: Mutex::new(false),
        }
    }

    /// Apply one engine event.
    pub fn observe(&self, event: &ProgressEvent) {
        let mut total_set = self.total_set.lock().expect("progress state poisoned");
        if !*total_set {
            self.bar.set_length(event.total_bytes);
            *total_set = true;
        }
        drop(total_set);
        self.bar.set_position(event.bytes_done);
    }

    /// Finish with a message.
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    /// Abandon the bar on error.
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

/// Format bytes in human-readable form.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}
