//! Progress reporting

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Receives pipeline progress; called concurrently from workers
pub trait ProgressMonitor: Send + Sync {
    /// Identifiers queued for loading
    fn documents_to_add(&self, count: u64);
    fn entities_loaded(&self, count: u64);
    fn documents_built(&self, count: u64);
    fn documents_added(&self, count: u64);
    /// Every pipeline finished
    fn indexing_completed(&self);
}

/// Logs throughput every `interval` added documents
#[derive(Debug)]
pub struct LoggingProgressMonitor {
    interval: u64,
    started: Instant,
    to_add: AtomicU64,
    loaded: AtomicU64,
    built: AtomicU64,
    added: AtomicU64,
}

impl LoggingProgressMonitor {
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            started: Instant::now(),
            to_add: AtomicU64::new(0),
            loaded: AtomicU64::new(0),
            built: AtomicU64::new(0),
            added: AtomicU64::new(0),
        }
    }

    pub fn added(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    pub fn loaded(&self) -> u64 {
        self.loaded.load(Ordering::Relaxed)
    }

    pub fn built(&self) -> u64 {
        self.built.load(Ordering::Relaxed)
    }

    pub fn to_add(&self) -> u64 {
        self.to_add.load(Ordering::Relaxed)
    }

    #[allow(clippy::cast_precision_loss)]
    fn rate(&self, done: u64) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 { done as f64 / secs } else { 0.0 }
    }
}

impl Default for LoggingProgressMonitor {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl ProgressMonitor for LoggingProgressMonitor {
    fn documents_to_add(&self, count: u64) {
        self.to_add.fetch_add(count, Ordering::Relaxed);
    }

    fn entities_loaded(&self, count: u64) {
        self.loaded.fetch_add(count, Ordering::Relaxed);
    }

    fn documents_built(&self, count: u64) {
        self.built.fetch_add(count, Ordering::Relaxed);
    }

    fn documents_added(&self, count: u64) {
        let previous = self.added.fetch_add(count, Ordering::Relaxed);
        let now = previous + count;
        if previous / self.interval != now / self.interval {
            info!(
                "{} documents indexed in {:.1?} ({:.0} documents/second, {} queued)",
                now,
                self.started.elapsed(),
                self.rate(now),
                self.to_add()
            );
        }
    }

    fn indexing_completed(&self) {
        let added = self.added();
        info!(
            "indexing completed: {} documents in {:.1?} ({:.0} documents/second)",
            added,
            self.started.elapsed(),
            self.rate(added)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let monitor = LoggingProgressMonitor::new(10);
        monitor.documents_to_add(25);
        monitor.entities_loaded(25);
        for _ in 0..25 {
            monitor.documents_built(1);
            monitor.documents_added(1);
        }
        monitor.indexing_completed();
        assert_eq!(monitor.to_add(), 25);
        assert_eq!(monitor.loaded(), 25);
        assert_eq!(monitor.built(), 25);
        assert_eq!(monitor.added(), 25);
    }
}
