//! Per-file progress bars.

use std::collections::HashMap;
use std::sync::Mutex;

use chunkify_transfer::{UploadProgress, UploadResult, UploadStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

const TEMPLATE: &str =
    "{msg:20!} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// One bar per file, created on its first progress update.
pub struct UploadBars {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl UploadBars {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// Moves the file's bar to the reported byte count.
    pub fn update(&self, progress: &UploadProgress) {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        let bar = bars
            .entry(progress.reference.clone())
            .or_insert_with(|| self.add_bar(&progress.file_name, progress.total_bytes));
        bar.set_position(progress.uploaded_bytes);
    }

    /// Finishes the bar for `result` with its terminal status.
    pub fn finish(&self, result: &UploadResult) {
        let bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        let Some(bar) = bars.get(&result.reference) else {
            return;
        };
        match result.status {
            UploadStatus::Completed => bar.finish_with_message(format!("{} done", result.file_name)),
            status => bar.abandon_with_message(format!("{} {status}", result.file_name)),
        }
    }

    fn add_bar(&self, file_name: &str, total_bytes: u64) -> ProgressBar {
        let bar = self.multi.add(ProgressBar::new(total_bytes));
        let style = ProgressStyle::default_bar()
            .template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar.set_message(file_name.to_string());
        bar
    }
}

/// Formats bytes in human-readable form.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{size:.2} {}", UNITS[unit])
}
