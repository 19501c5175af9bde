use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use tokio::sync::Semaphore;
use url::Url;
use tracing::{debug, warn};

use crate::browser::scanner::PageScanner;
use crate::crawler::types::CrawlError;

/// Normalize a URL so trivially different spellings of the same page
/// deduplicate: lowercase host, default ports and fragments removed, sorted
/// query parameters, no trailing slash on the root path.
pub fn normalize_url(url: &str) -> String {
    let parsed_url = match Url::parse(url) {
        Ok(url) => url,
        Err(_) => return url.to_string(),
    };

    let mut normalized = parsed_url.clone();

    if let Some(port) = normalized.port() {
        if (normalized.scheme() == "http" && port == 80)
            || (normalized.scheme() == "https" && port == 443)
        {
            let _ = normalized.set_port(None);
        }
    }

    if normalized.path() == "/" {
        normalized.set_path("");
    }

    if let Some(host) = normalized.host_str() {
        let lowercase_host = host.to_lowercase();
        if host != lowercase_host {
            if let Ok(temp_url) =
                Url::parse(&normalized.to_string().replace(host, &lowercase_host))
            {
                normalized = temp_url;
            }
        }
    }

    if let Some(query) = normalized.query() {
        if !query.is_empty() {
            let mut params: Vec<(String, String)> = query
                .split('&')
                .map(|pair| {
                    let mut kv = pair.split('=');
                    (
                        kv.next().unwrap_or("").to_string(),
                        kv.next().unwrap_or("").to_string(),
                    )
                })
                .collect();

            params.sort_by(|a, b| a.0.cmp(&b.0));

            let sorted_query = params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<String>>()
                .join("&");

            normalized.set_query(Some(&sorted_query));
        }
    }

    normalized.set_fragment(None);

    normalized.to_string()
}

/// Breadth-limited same-origin link discovery.
///
/// Starting from the entry page, each level's pages are loaded and their
/// same-host links collected until `max_pages` unique URLs are known, the
/// frontier empties, or `max_depth` is reached — any of the three is normal
/// termination.
pub struct LinkDiscovery {
    scanner: Arc<dyn PageScanner>,
    exclude_patterns: Vec<Regex>,
    max_depth: u32,
    concurrency: usize,
}

impl LinkDiscovery {
    pub fn new(
        scanner: Arc<dyn PageScanner>,
        exclude_patterns: &[String],
        max_depth: u32,
        concurrency: usize,
    ) -> Self {
        let exclude_patterns = exclude_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("Invalid exclude pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        Self {
            scanner,
            exclude_patterns,
            max_depth,
            concurrency: concurrency.max(1),
        }
    }

    /// Collect up to `max_pages` unique same-origin URLs reachable from the
    /// entry page. The entry page itself is always the first result; failure
    /// to load it is fatal for the run.
    pub async fn discover(
        &self,
        entry: &str,
        max_pages: usize,
    ) -> Result<Vec<String>, CrawlError> {
        let entry_url = normalize_url(entry);
        let base = Url::parse(&entry_url)
            .map_err(|e| CrawlError::EntryPage(format!("invalid entry URL: {e}")))?;
        let host = base
            .host_str()
            .ok_or_else(|| CrawlError::EntryPage("entry URL has no host".to_string()))?
            .to_lowercase();

        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(entry_url.clone());
        let mut discovered = vec![entry_url.clone()];
        let mut frontier = vec![entry_url];

        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        for depth in 0..self.max_depth {
            if frontier.is_empty() || discovered.len() >= max_pages {
                break;
            }

            let scans = futures::future::join_all(frontier.drain(..).map(|url| {
                let scanner = Arc::clone(&self.scanner);
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = semaphore.acquire().await;
                    let result = scanner.scan_page(&url).await;
                    (url, result)
                }
            }))
            .await;

            for (url, result) in scans {
                let scan = match result {
                    Ok(scan) => scan,
                    Err(e) if depth == 0 && url == discovered[0] => {
                        return Err(CrawlError::EntryPage(e.to_string()));
                    }
                    Err(e) => {
                        debug!("Discovery skipped {}: {}", url, e);
                        continue;
                    }
                };

                for href in &scan.links {
                    if discovered.len() >= max_pages {
                        break;
                    }
                    if let Some(link) = self.accept(&base, &host, href) {
                        if seen.insert(link.clone()) {
                            discovered.push(link.clone());
                            frontier.push(link);
                        }
                    }
                }
            }
        }

        debug!(
            "Discovery finished with {} unique pages for {}",
            discovered.len(),
            host
        );

        Ok(discovered)
    }

    /// Resolve a raw href against the entry page and keep it only if it is a
    /// same-host http(s) URL that no exclusion pattern matches.
    fn accept(&self, base: &Url, host: &str, href: &str) -> Option<String> {
        let absolute = match Url::parse(href) {
            Ok(url) => url,
            Err(_) => base.join(href).ok()?,
        };

        if absolute.scheme() != "http" && absolute.scheme() != "https" {
            return None;
        }

        if absolute.host_str()?.to_lowercase() != host {
            return None;
        }

        let normalized = normalize_url(absolute.as_str());

        for pattern in &self.exclude_patterns {
            if pattern.is_match(&normalized) {
                debug!("Skipping URL matching exclusion pattern: {}", normalized);
                return None;
            }
        }

        Some(normalized)
    }
}
