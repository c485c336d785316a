//! Terminal progress display for the long-running stages

use std::sync::LazyLock;

use indicatif::{ProgressBar, ProgressStyle};

static SLICE_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{prefix:>24} [{bar:30.cyan/blue}] {pos}/{len} slices {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏ ")
});

static BUNDLE_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{prefix:>24} [{bar:30.green/white}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
});

/// A progress bar that can be switched off entirely
///
/// Hidden bars accept every call and draw nothing, so callers never branch
/// on `--quiet`.
pub struct StageProgress {
    bar: ProgressBar,
}

impl StageProgress {
    /// Bar counting network slices
    pub fn slices(show: bool, label: &str, total: usize) -> Self {
        Self::with_style(show, label, total, &SLICE_STYLE)
    }

    /// Bar counting bundles (tracking, saving)
    pub fn bundles(show: bool, label: &str, total: usize) -> Self {
        Self::with_style(show, label, total, &BUNDLE_STYLE)
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    fn with_style(show: bool, label: &str, total: usize, style: &ProgressStyle) -> Self {
        if !show {
            return Self::hidden();
        }
        let bar = ProgressBar::new(total as u64);
        bar.set_style(style.clone());
        bar.set_prefix(label.to_string());
        Self { bar }
    }

    pub fn advance(&self, n: usize) {
        self.bar.inc(n as u64);
    }

    pub fn set_message(&self, msg: &str) {
        self.bar.set_message(msg.to_string());
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_progress_still_counts() {
        let p = StageProgress::slices(false, "tract_segmentation", 10);
        p.advance(3);
        p.advance(2);
        assert_eq!(p.position(), 5);
        p.finish();
    }
}
