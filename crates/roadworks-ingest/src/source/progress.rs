//! Progress bars for downloads and record counts

use indicatif::{ProgressBar, ProgressStyle};

const BYTES_TEMPLATE: &str =
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})";
const BYTES_SPINNER_TEMPLATE: &str = "{msg}\n{spinner:.green} [{elapsed_precise}] {bytes} ({bytes_per_sec})";
const COUNT_TEMPLATE: &str =
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})";
const COUNT_SPINNER_TEMPLATE: &str = "{msg}\n{spinner:.green} [{elapsed_precise}] {pos} ({per_sec})";

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Bar counting downloaded bytes; a spinner when the size is unknown
pub fn bytes_bar(total: Option<u64>, message: impl Into<String>, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }

    let bar = match total {
        Some(len) if len > 0 => ProgressBar::new(len).with_style(style(BYTES_TEMPLATE)),
        _ => ProgressBar::new_spinner().with_style(style(BYTES_SPINNER_TEMPLATE)),
    };
    bar.with_message(message.into())
}

/// Bar counting records; a spinner when the total is unknown
pub fn count_bar(total: Option<u64>, message: impl Into<String>, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }

    let bar = match total {
        Some(len) => ProgressBar::new(len).with_style(style(COUNT_TEMPLATE)),
        None => ProgressBar::new_spinner().with_style(style(COUNT_SPINNER_TEMPLATE)),
    };
    bar.with_message(message.into())
}
