use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-level error taxonomy. Per-page variants are collected into the
/// crawl result; run-level variants abort the crawl.
#[derive(Debug, Clone, Error)]
pub enum CrawlError {
    #[error("page load timed out after {0:?}")]
    Timeout(Duration),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("entry page unreachable: {0}")]
    EntryPage(String),

    #[error("checkpoint unavailable: {0}")]
    Checkpoint(String),

    #[error("crawl cancelled")]
    Cancelled,
}

/// Kind of web storage an entry was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Local,
    Session,
}

/// A cookie as observed on a single page, before aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageCookie {
    pub name: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    /// Expiry as a unix timestamp; None for session cookies.
    pub expires_at: Option<i64>,
    pub value_size: usize,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<String>,
}

/// A localStorage/sessionStorage entry as observed on a single page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageStorageItem {
    pub kind: StorageKind,
    pub key: String,
    pub value_size: usize,
}

/// Everything extracted from one successful page load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageScan {
    /// URL the scan was requested for.
    pub url: String,
    pub cookies: Vec<PageCookie>,
    pub storage: Vec<PageStorageItem>,
    /// Raw href values found on the page, possibly relative.
    pub links: Vec<String>,
}

/// A deduplicated cookie across the whole crawl. This is the stable schema
/// handed to the external classification collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub domain: String,
    pub path: String,
    /// Seconds until expiry at observation time; None for session cookies.
    pub duration_seconds: Option<i64>,
    pub size_bytes: usize,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<String>,
    pub third_party: bool,
    /// Every page the cookie was observed on.
    pub pages: Vec<String>,
}

/// A deduplicated storage entry across the whole crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRecord {
    pub kind: StorageKind,
    pub key: String,
    pub value_size: usize,
    pub pages: Vec<String>,
}

/// A page that could not be scanned, with the reason it failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageFailure {
    pub url: String,
    pub reason: String,
}

/// Final aggregated output of a crawl run. Partial coverage is a normal
/// outcome: failures are reported alongside the successful data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub job_id: String,
    pub site: String,
    pub pages_scanned: usize,
    pub pages_failed: usize,
    pub failures: Vec<PageFailure>,
    pub cookies: Vec<CookieRecord>,
    pub storage: Vec<StorageRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Accumulates page scans into deduplicated cookie/storage records.
///
/// Cookies are keyed by (name, domain, path); storage entries by (kind, key).
/// Every page a record was observed on is remembered.
pub struct ResultAggregator {
    site_host: String,
    cookies: HashMap<(String, String, String), CookieRecord>,
    storage: HashMap<(StorageKind, String), StorageRecord>,
    failures: Vec<PageFailure>,
    pages_scanned: usize,
}

impl ResultAggregator {
    /// Create an empty aggregator for the given site.
    pub fn new(site: &str) -> Self {
        let site_host = url::Url::parse(site)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .unwrap_or_else(|| site.to_lowercase());

        Self {
            site_host,
            cookies: HashMap::new(),
            storage: HashMap::new(),
            failures: Vec::new(),
            pages_scanned: 0,
        }
    }

    /// Rebuild an aggregator from previously checkpointed state.
    pub fn from_parts(
        site: &str,
        cookies: Vec<CookieRecord>,
        storage: Vec<StorageRecord>,
        failures: Vec<PageFailure>,
        pages_scanned: usize,
    ) -> Self {
        let mut agg = Self::new(site);
        for c in cookies {
            agg.cookies
                .insert((c.name.clone(), c.domain.clone(), c.path.clone()), c);
        }
        for s in storage {
            agg.storage.insert((s.kind, s.key.clone()), s);
        }
        agg.failures = failures;
        agg.pages_scanned = pages_scanned;
        agg
    }

    /// Fold one successful page scan into the aggregate.
    pub fn add_scan(&mut self, scan: &PageScan) {
        self.pages_scanned += 1;

        for cookie in &scan.cookies {
            let domain = cookie
                .domain
                .as_deref()
                .map(|d| d.trim_start_matches('.').to_lowercase())
                .unwrap_or_else(|| self.site_host.clone());
            let path = cookie.path.clone().unwrap_or_else(|| "/".to_string());
            let key = (cookie.name.clone(), domain.clone(), path.clone());

            let entry = self.cookies.entry(key).or_insert_with(|| CookieRecord {
                name: cookie.name.clone(),
                third_party: !Self::domain_matches(&self.site_host, &domain),
                domain,
                path,
                duration_seconds: cookie
                    .expires_at
                    .map(|ts| ts.saturating_sub(Utc::now().timestamp())),
                size_bytes: cookie.name.len() + cookie.value_size,
                http_only: cookie.http_only,
                secure: cookie.secure,
                same_site: cookie.same_site.clone(),
                pages: Vec::new(),
            });

            if !entry.pages.contains(&scan.url) {
                entry.pages.push(scan.url.clone());
            }
        }

        for item in &scan.storage {
            let entry = self
                .storage
                .entry((item.kind, item.key.clone()))
                .or_insert_with(|| StorageRecord {
                    kind: item.kind,
                    key: item.key.clone(),
                    value_size: item.value_size,
                    pages: Vec::new(),
                });

            if !entry.pages.contains(&scan.url) {
                entry.pages.push(scan.url.clone());
            }
        }
    }

    /// Record a page that could not be scanned.
    pub fn add_failure(&mut self, url: &str, reason: &str) {
        self.failures.push(PageFailure {
            url: url.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn pages_scanned(&self) -> usize {
        self.pages_scanned
    }

    pub fn pages_failed(&self) -> usize {
        self.failures.len()
    }

    pub fn cookies_found(&self) -> usize {
        self.cookies.len()
    }

    /// Snapshot the aggregated cookies, sorted for stable output.
    pub fn snapshot_cookies(&self) -> Vec<CookieRecord> {
        let mut cookies: Vec<_> = self.cookies.values().cloned().collect();
        cookies.sort_by(|a, b| {
            (&a.name, &a.domain, &a.path).cmp(&(&b.name, &b.domain, &b.path))
        });
        cookies
    }

    /// Snapshot the aggregated storage entries, sorted for stable output.
    pub fn snapshot_storage(&self) -> Vec<StorageRecord> {
        let mut storage: Vec<_> = self.storage.values().cloned().collect();
        storage.sort_by(|a, b| (a.kind, &a.key).cmp(&(b.kind, &b.key)));
        storage
    }

    pub fn snapshot_failures(&self) -> Vec<PageFailure> {
        self.failures.clone()
    }

    /// Finish the crawl and produce the final result.
    pub fn into_result(
        self,
        job_id: String,
        site: String,
        started_at: DateTime<Utc>,
    ) -> CrawlResult {
        let cookies = self.snapshot_cookies();
        let storage = self.snapshot_storage();

        CrawlResult {
            job_id,
            site,
            pages_scanned: self.pages_scanned,
            pages_failed: self.failures.len(),
            failures: self.failures,
            cookies,
            storage,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// True when a cookie domain belongs to the audited site.
    fn domain_matches(site_host: &str, cookie_domain: &str) -> bool {
        site_host == cookie_domain
            || site_host.ends_with(&format!(".{}", cookie_domain))
            || cookie_domain.ends_with(&format!(".{}", site_host))
    }
}
