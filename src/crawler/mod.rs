pub mod direct;
pub mod discovery;
pub mod progress;
pub mod scaled;
pub mod types;

// Re-export common types
pub use direct::DirectCrawler;
pub use discovery::{normalize_url, LinkDiscovery};
pub use progress::{CrawlEvent, ProgressSnapshot, ProgressTracker};
pub use scaled::{CancelHandle, ScaledCrawler, ScaledParams};
pub use types::{CookieRecord, CrawlError, CrawlResult, PageFailure, PageScan, StorageRecord};
