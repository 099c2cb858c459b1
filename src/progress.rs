//! Progress reporting for long-running stages.
//!
//! Thread-safe counters updated by the workers, with an optional
//! percent display on stderr (suppressed by `--hp`). The display is an
//! observer; nothing in the pipeline depends on it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Progress snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    /// Input bytes consumed so far.
    pub bytes_processed: u64,
    /// Total input bytes, when known.
    pub bytes_total: u64,
}

impl Progress {
    /// Completion percentage, clamped to 100.
    #[must_use]
    pub fn percent(&self) -> u64 {
        if self.bytes_total == 0 {
            0
        } else {
            (self.bytes_processed * 100 / self.bytes_total).min(100)
        }
    }
}

/// Shared progress counters plus the stderr display switch.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    bytes_processed: AtomicU64,
    bytes_total: AtomicU64,
    last_percent: AtomicU64,
    visible: std::sync::atomic::AtomicBool,
}

impl ProgressTracker {
    /// A tracker; `visible` enables the stderr percent display.
    #[must_use]
    pub fn new(visible: bool) -> Self {
        Self {
            bytes_processed: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            last_percent: AtomicU64::new(u64::MAX),
            visible: std::sync::atomic::AtomicBool::new(visible),
        }
    }

    /// Sets the denominator (sum of input file sizes).
    pub fn set_total(&self, bytes: u64) {
        self.bytes_total.store(bytes, Ordering::Relaxed);
    }

    /// Records consumed input bytes and refreshes the display.
    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
        if self.visible.load(Ordering::Relaxed) {
            let pct = self.snapshot().percent();
            if self.last_percent.swap(pct, Ordering::Relaxed) != pct {
                eprint!("\r{pct}%");
            }
        }
    }

    /// Ends the display line.
    pub fn finish(&self) {
        if self.visible.load(Ordering::Relaxed)
            && self.last_percent.load(Ordering::Relaxed) != u64::MAX
        {
            eprintln!();
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Progress {
        Progress {
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_computation() {
        let tracker = ProgressTracker::new(false);
        tracker.set_total(200);
        tracker.add_bytes(50);
        assert_eq!(tracker.snapshot().percent(), 25);
        tracker.add_bytes(200);
        assert_eq!(tracker.snapshot().percent(), 100);
    }

    #[test]
    fn zero_total_is_zero_percent() {
        let tracker = ProgressTracker::new(false);
        tracker.add_bytes(10);
        assert_eq!(tracker.snapshot().percent(), 0);
    }
}
