use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::browser::scanner::PageScanner;
use crate::checkpoint::{Checkpoint, CheckpointStore, CHECKPOINT_VERSION};
use crate::crawler::discovery::LinkDiscovery;
use crate::crawler::progress::{emit, CrawlEvent, ProgressTracker};
use crate::crawler::types::{CrawlError, CrawlResult, ResultAggregator};

/// Tuning knobs for a scaled crawl.
#[derive(Debug, Clone)]
pub struct ScaledParams {
    pub max_pages: usize,
    pub chunk_size: usize,
    pub checkpoint_interval: usize,
    pub pool_size: usize,
    pub pages_per_instance: usize,
}

impl Default for ScaledParams {
    fn default() -> Self {
        Self {
            max_pages: 10_000,
            chunk_size: 1000,
            checkpoint_interval: 100,
            pool_size: 3,
            pages_per_instance: 4,
        }
    }
}

/// Cooperative cancellation flag shared with an in-flight scaled crawl.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Deep/enterprise-mode crawler for sites up to tens of thousands of pages.
///
/// Pending pages are processed in chunks, strictly in sequence, so every
/// checkpoint reflects a consistent prefix of the work; within a chunk,
/// completion order is first-to-finish. Individual page failures are counted
/// and excluded, never fatal. Hitting `max_pages` before the pending set is
/// exhausted is normal termination, not an error.
pub struct ScaledCrawler {
    scanner: Arc<dyn PageScanner>,
    discovery: LinkDiscovery,
    checkpoints: Arc<dyn CheckpointStore>,
    params: ScaledParams,
}

impl ScaledCrawler {
    pub fn new(
        scanner: Arc<dyn PageScanner>,
        discovery: LinkDiscovery,
        checkpoints: Arc<dyn CheckpointStore>,
        params: ScaledParams,
    ) -> Self {
        Self {
            scanner,
            discovery,
            checkpoints,
            params,
        }
    }

    /// Run a scaled crawl under the given job id. With `resume` set, state
    /// is seeded from that job's checkpoint and completed pages are never
    /// re-scanned; otherwise link discovery builds the pending set.
    pub async fn run(
        &self,
        site: &str,
        job_id: &str,
        resume: bool,
        events: Option<UnboundedSender<CrawlEvent>>,
        cancel: &CancelHandle,
    ) -> Result<CrawlResult, CrawlError> {
        let started_at;
        let mut completed: HashSet<String>;
        let mut pending: Vec<String>;
        let mut aggregator;

        if resume {
            let checkpoint = self
                .checkpoints
                .load(job_id)
                .await
                .map_err(|e| CrawlError::Checkpoint(format!("{e:#}")))?
                .ok_or_else(|| {
                    CrawlError::Checkpoint(format!("no checkpoint found for job {job_id}"))
                })?;

            info!(
                "Resuming crawl {}: {} completed, {} pending",
                job_id,
                checkpoint.completed.len(),
                checkpoint.pending.len()
            );

            started_at = checkpoint.started_at;
            completed = checkpoint.completed.iter().cloned().collect();
            pending = checkpoint
                .pending
                .into_iter()
                .filter(|url| !completed.contains(url))
                .collect();
            aggregator = ResultAggregator::from_parts(
                site,
                checkpoint.cookies,
                checkpoint.storage,
                checkpoint.failures,
                checkpoint.pages_scanned,
            );
        } else {
            started_at = Utc::now();
            completed = HashSet::new();
            pending = self.discovery.discover(site, self.params.max_pages).await?;
            aggregator = ResultAggregator::new(site);

            info!(
                "Crawl {} starting: {} pages discovered on {}",
                job_id,
                pending.len(),
                site
            );
        }

        let concurrency = (self.params.pool_size * self.params.pages_per_instance).max(1);
        let total_pages = (completed.len() + pending.len()).min(self.params.max_pages);
        let tracker = ProgressTracker::new(total_pages, concurrency);
        emit(&events, CrawlEvent::Started { total_pages });

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut since_checkpoint = 0usize;
        let mut cancelled = false;

        while !pending.is_empty() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let budget = self.params.max_pages.saturating_sub(completed.len());
            if budget == 0 {
                info!(
                    "Crawl {} reached max pages ({}), stopping with partial coverage",
                    job_id, self.params.max_pages
                );
                break;
            }

            let take = budget.min(self.params.chunk_size).min(pending.len());
            let chunk: Vec<String> = pending.drain(..take).collect();
            let mut outstanding: HashSet<String> = chunk.iter().cloned().collect();

            let mut tasks = JoinSet::new();
            for url in chunk {
                let scanner = Arc::clone(&self.scanner);
                let semaphore = Arc::clone(&semaphore);
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let permit = semaphore.acquire_owned().await;
                    if permit.is_err() || cancel.is_cancelled() {
                        // Not attempted: the page stays pending.
                        return (url, None);
                    }
                    let result = scanner.scan_page(&url).await;
                    (url, Some(result))
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (url, outcome) = match joined {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Page task panicked: {}", e);
                        continue;
                    }
                };

                match outcome {
                    Some(Ok(scan)) => {
                        aggregator.add_scan(&scan);
                        completed.insert(url.clone());
                        outstanding.remove(&url);
                        since_checkpoint += 1;
                    }
                    Some(Err(e)) => {
                        debug!("Page failed, excluded from results: {}: {}", url, e);
                        aggregator.add_failure(&url, &e.to_string());
                        completed.insert(url.clone());
                        outstanding.remove(&url);
                        since_checkpoint += 1;
                    }
                    None => {}
                }

                if since_checkpoint >= self.params.checkpoint_interval.max(1) {
                    since_checkpoint = 0;
                    self.save_checkpoint(
                        job_id, site, &completed, &pending, &outstanding, &aggregator, started_at,
                    )
                    .await;
                }
            }

            // Pages never attempted (cancellation) go back to the front of
            // the pending list so the checkpoint keeps them.
            for url in outstanding {
                pending.insert(0, url);
            }

            self.save_checkpoint(
                job_id,
                site,
                &completed,
                &pending,
                &HashSet::new(),
                &aggregator,
                started_at,
            )
            .await;
            since_checkpoint = 0;

            emit(
                &events,
                CrawlEvent::Progress(tracker.snapshot(
                    aggregator.pages_scanned(),
                    aggregator.pages_failed(),
                    aggregator.cookies_found(),
                )),
            );

            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
        }

        if cancelled {
            info!(
                "Crawl {} cancelled: {} pages completed, checkpoint retained for resume",
                job_id,
                completed.len()
            );
            self.save_checkpoint(
                job_id,
                site,
                &completed,
                &pending,
                &HashSet::new(),
                &aggregator,
                started_at,
            )
            .await;
            emit(&events, CrawlEvent::Failed {
                error: "crawl cancelled".to_string(),
            });
            return Err(CrawlError::Cancelled);
        }

        if let Err(e) = self.checkpoints.delete(job_id).await {
            warn!("Failed to delete checkpoint for job {}: {e:#}", job_id);
        }

        emit(&events, CrawlEvent::Completed {
            pages_scanned: aggregator.pages_scanned(),
            pages_failed: aggregator.pages_failed(),
            cookies_found: aggregator.cookies_found(),
        });

        let result = aggregator.into_result(job_id.to_string(), site.to_string(), started_at);
        info!(
            "Crawl {} finished: {} scanned, {} failed, {} cookies",
            job_id, result.pages_scanned, result.pages_failed, result.cookies.len()
        );

        Ok(result)
    }

    /// Persist the current crawl state. A checkpoint-store failure degrades
    /// the run to memory-only; it never aborts the crawl.
    #[allow(clippy::too_many_arguments)]
    async fn save_checkpoint(
        &self,
        job_id: &str,
        site: &str,
        completed: &HashSet<String>,
        pending: &[String],
        outstanding: &HashSet<String>,
        aggregator: &ResultAggregator,
        started_at: DateTime<Utc>,
    ) {
        let mut completed: Vec<String> = completed.iter().cloned().collect();
        completed.sort();

        let mut pending_all: Vec<String> = outstanding.iter().cloned().collect();
        pending_all.extend(pending.iter().cloned());

        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            job_id: job_id.to_string(),
            site: site.to_string(),
            completed,
            pending: pending_all,
            cookies: aggregator.snapshot_cookies(),
            storage: aggregator.snapshot_storage(),
            failures: aggregator.snapshot_failures(),
            pages_scanned: aggregator.pages_scanned(),
            started_at,
            updated_at: Utc::now(),
        };

        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            warn!(
                "Checkpoint write failed for job {}, continuing in memory only: {e:#}",
                job_id
            );
        }
    }
}
