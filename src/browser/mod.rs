pub mod instance;
pub mod pool;
pub mod scanner;

// Re-export common types
pub use instance::{Browser, BrowserFactory, WebDriverBrowser, WebDriverFactory};
pub use pool::{BrowserPool, PooledBrowser};
pub use scanner::{PageScanner, PoolScanner};
