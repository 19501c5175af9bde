use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use uuid::Uuid;

use crate::browser::scanner::PageScanner;
use crate::crawler::discovery::normalize_url;
use crate::crawler::progress::{emit, CrawlEvent, ProgressTracker};
use crate::crawler::types::{CrawlResult, ResultAggregator};

/// Quick-mode crawler for a bounded, caller-supplied page list.
///
/// No link discovery, no checkpointing: every page is scanned concurrently
/// under one counting semaphore, failures are collected rather than thrown,
/// and the aggregated result is returned when the last task finishes.
pub struct DirectCrawler {
    scanner: Arc<dyn PageScanner>,
}

impl DirectCrawler {
    pub fn new(scanner: Arc<dyn PageScanner>) -> Self {
        Self { scanner }
    }

    /// Scan the given pages (the site entry page when none are supplied)
    /// with at most `concurrency` loads in flight.
    pub async fn run(
        &self,
        site: &str,
        pages: Vec<String>,
        concurrency: usize,
        events: Option<UnboundedSender<CrawlEvent>>,
    ) -> Result<CrawlResult> {
        let job_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let mut seen = std::collections::HashSet::new();
        let pages: Vec<String> = if pages.is_empty() {
            vec![normalize_url(site)]
        } else {
            pages
                .into_iter()
                .map(|p| normalize_url(&p))
                .filter(|p| seen.insert(p.clone()))
                .collect()
        };

        info!(
            "Direct crawl {} starting: {} pages, concurrency {}",
            job_id,
            pages.len(),
            concurrency
        );
        emit(&events, CrawlEvent::Started {
            total_pages: pages.len(),
        });

        let tracker = ProgressTracker::new(pages.len(), concurrency);
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        let scans = futures::future::join_all(pages.into_iter().map(|url| {
            let scanner = Arc::clone(&self.scanner);
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await;
                let result = scanner.scan_page(&url).await;
                (url, result)
            }
        }))
        .await;

        let mut aggregator = ResultAggregator::new(site);
        for (url, result) in scans {
            match result {
                Ok(scan) => aggregator.add_scan(&scan),
                Err(e) => {
                    debug!("Page failed, excluded from results: {}: {}", url, e);
                    aggregator.add_failure(&url, &e.to_string());
                }
            }
        }

        emit(
            &events,
            CrawlEvent::Progress(tracker.snapshot(
                aggregator.pages_scanned(),
                aggregator.pages_failed(),
                aggregator.cookies_found(),
            )),
        );
        emit(&events, CrawlEvent::Completed {
            pages_scanned: aggregator.pages_scanned(),
            pages_failed: aggregator.pages_failed(),
            cookies_found: aggregator.cookies_found(),
        });

        let result = aggregator.into_result(job_id, site.to_string(), started_at);
        info!(
            "Direct crawl {} finished: {} scanned, {} failed, {} cookies",
            result.job_id, result.pages_scanned, result.pages_failed, result.cookies.len()
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::browser::scanner::MockPageScanner;
    use crate::crawler::types::{CrawlError, PageCookie, PageScan};

    fn scan_with_cookie(url: &str) -> PageScan {
        let page = url.rsplit('/').next().unwrap_or("page").to_string();
        PageScan {
            url: url.to_string(),
            cookies: vec![
                PageCookie {
                    name: format!("cookie-{page}"),
                    domain: Some("example.com".to_string()),
                    path: Some("/".to_string()),
                    expires_at: None,
                    value_size: 8,
                    http_only: false,
                    secure: true,
                    same_site: None,
                },
                PageCookie {
                    name: "shared".to_string(),
                    domain: Some("example.com".to_string()),
                    path: Some("/".to_string()),
                    expires_at: None,
                    value_size: 8,
                    http_only: true,
                    secure: true,
                    same_site: Some("Lax".to_string()),
                },
            ],
            storage: vec![],
            links: vec![],
        }
    }

    #[tokio::test]
    async fn one_timeout_does_not_abort_the_batch() {
        let mut scanner = MockPageScanner::new();
        scanner.expect_scan_page().returning(|url| {
            if url.ends_with("/p2") {
                Err(CrawlError::Timeout(Duration::from_secs(30)))
            } else {
                Ok(scan_with_cookie(url))
            }
        });

        let pages: Vec<String> = (1..=5)
            .map(|i| format!("https://example.com/p{i}"))
            .collect();

        let crawler = DirectCrawler::new(Arc::new(scanner));
        let result = crawler
            .run("https://example.com", pages, 3, None)
            .await
            .unwrap();

        assert_eq!(result.pages_scanned, 4);
        assert_eq!(result.pages_failed, 1);
        assert_eq!(result.failures[0].url, "https://example.com/p2");

        // Four per-page cookies plus the shared one; nothing from p2.
        assert_eq!(result.cookies.len(), 5);
        assert!(!result.cookies.iter().any(|c| c.name == "cookie-p2"));

        let shared = result.cookies.iter().find(|c| c.name == "shared").unwrap();
        assert_eq!(shared.pages.len(), 4);
    }

    #[tokio::test]
    async fn duplicate_pages_are_scanned_once() {
        let mut scanner = MockPageScanner::new();
        scanner
            .expect_scan_page()
            .times(1)
            .returning(|url| Ok(scan_with_cookie(url)));

        let crawler = DirectCrawler::new(Arc::new(scanner));
        let result = crawler
            .run(
                "https://example.com",
                vec![
                    "https://example.com/a".to_string(),
                    "https://EXAMPLE.com/a".to_string(),
                ],
                2,
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.pages_scanned, 1);
    }

    #[tokio::test]
    async fn lifecycle_events_are_emitted() {
        let mut scanner = MockPageScanner::new();
        scanner
            .expect_scan_page()
            .returning(|url| Ok(scan_with_cookie(url)));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let crawler = DirectCrawler::new(Arc::new(scanner));
        crawler
            .run(
                "https://example.com",
                vec!["https://example.com/a".to_string()],
                1,
                Some(tx),
            )
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert!(matches!(events[0], CrawlEvent::Started { total_pages: 1 }));
        assert!(matches!(events[1], CrawlEvent::Progress(_)));
        assert!(matches!(
            events.last(),
            Some(CrawlEvent::Completed { pages_scanned: 1, .. })
        ));
    }
}
