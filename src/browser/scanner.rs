use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::browser::pool::BrowserPool;
use crate::crawler::types::{CrawlError, PageScan};

/// The seam between the crawl engines and the browser layer: load one page
/// and extract everything the audit needs from it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageScanner: Send + Sync {
    async fn scan_page(&self, url: &str) -> Result<PageScan, CrawlError>;
}

/// Scans pages with browsers checked out of the shared pool. Each scan holds
/// one instance for its duration and returns it on every path.
pub struct PoolScanner {
    pool: Arc<BrowserPool>,
    page_timeout: Duration,
}

impl PoolScanner {
    pub fn new(pool: Arc<BrowserPool>, page_timeout: Duration) -> Self {
        Self { pool, page_timeout }
    }
}

#[async_trait]
impl PageScanner for PoolScanner {
    async fn scan_page(&self, url: &str) -> Result<PageScan, CrawlError> {
        let mut instance = self
            .pool
            .checkout()
            .await
            .map_err(|e| CrawlError::Navigation(format!("{e:#}")))?;

        let outcome =
            tokio::time::timeout(self.page_timeout, instance.browser().load_page(url)).await;

        let result = match outcome {
            Err(_) => {
                debug!("Page load timed out: {}", url);
                // The engine may be stuck mid-navigation; recycle it.
                instance.flag_unhealthy();
                Err(CrawlError::Timeout(self.page_timeout))
            }
            Ok(Err(e)) => {
                debug!("Page load failed: {}: {e:#}", url);
                Err(CrawlError::Navigation(format!("{e:#}")))
            }
            Ok(Ok(scan)) => Ok(scan),
        };

        self.pool.give_back(instance).await;
        result
    }
}
