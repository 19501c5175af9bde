use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Metrics snapshot pushed to the progress stream during a crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total_pages: usize,
    pub scanned_pages: usize,
    pub failed_pages: usize,
    pub cookies_found: usize,
    pub pages_per_second: f64,
    pub estimated_remaining_seconds: Option<u64>,
    /// Concurrency limit the crawl is currently running with.
    pub active_concurrency: usize,
}

/// Lifecycle events emitted over the progress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CrawlEvent {
    Started { total_pages: usize },
    Progress(ProgressSnapshot),
    Completed {
        pages_scanned: usize,
        pages_failed: usize,
        cookies_found: usize,
    },
    Failed { error: String },
}

/// Computes throughput and remaining-time estimates for a running crawl.
pub struct ProgressTracker {
    started: Instant,
    total_pages: usize,
    concurrency: usize,
}

impl ProgressTracker {
    pub fn new(total_pages: usize, concurrency: usize) -> Self {
        Self {
            started: Instant::now(),
            total_pages,
            concurrency,
        }
    }

    /// Build a snapshot from the current aggregate counters.
    pub fn snapshot(
        &self,
        scanned_pages: usize,
        failed_pages: usize,
        cookies_found: usize,
    ) -> ProgressSnapshot {
        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        let attempted = scanned_pages + failed_pages;
        let pages_per_second = attempted as f64 / elapsed;

        let remaining = self.total_pages.saturating_sub(attempted);
        let estimated_remaining_seconds = if attempted > 0 && remaining > 0 {
            Some((remaining as f64 / pages_per_second).ceil() as u64)
        } else {
            None
        };

        ProgressSnapshot {
            total_pages: self.total_pages,
            scanned_pages,
            failed_pages,
            cookies_found,
            pages_per_second,
            estimated_remaining_seconds,
            active_concurrency: self.concurrency,
        }
    }
}

/// Push an event to the optional progress channel. A closed or absent
/// receiver never disturbs the crawl itself.
pub fn emit(events: &Option<UnboundedSender<CrawlEvent>>, event: CrawlEvent) {
    if let Some(tx) = events {
        if tx.send(event).is_err() {
            debug!("progress receiver dropped, event discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_counts_and_estimate() {
        let tracker = ProgressTracker::new(100, 12);
        let snap = tracker.snapshot(40, 10, 25);

        assert_eq!(snap.total_pages, 100);
        assert_eq!(snap.scanned_pages, 40);
        assert_eq!(snap.failed_pages, 10);
        assert_eq!(snap.cookies_found, 25);
        assert_eq!(snap.active_concurrency, 12);
        assert!(snap.pages_per_second > 0.0);
        assert!(snap.estimated_remaining_seconds.is_some());
    }

    #[test]
    fn no_estimate_when_done_or_idle() {
        let tracker = ProgressTracker::new(10, 4);
        assert!(tracker.snapshot(0, 0, 0).estimated_remaining_seconds.is_none());
        assert!(tracker.snapshot(10, 0, 3).estimated_remaining_seconds.is_none());
    }
}
