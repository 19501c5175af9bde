use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thirtyfour::prelude::*;
use tracing::{debug, error};

use crate::cli::config::BrowserSettings;
use crate::crawler::types::{PageCookie, PageScan, PageStorageItem, StorageKind};

/// Script that dumps localStorage and sessionStorage keys with value sizes.
const STORAGE_SCRIPT: &str = r#"
const out = [];
try {
    for (let i = 0; i < localStorage.length; i++) {
        const k = localStorage.key(i);
        out.push({ kind: "local", key: k, size: (localStorage.getItem(k) || "").length });
    }
    for (let i = 0; i < sessionStorage.length; i++) {
        const k = sessionStorage.key(i);
        out.push({ kind: "session", key: k, size: (sessionStorage.getItem(k) || "").length });
    }
} catch (e) {}
return out;
"#;

/// One browser engine. The pool only needs lifecycle operations; the page
/// operations are what the crawl engines consume through `PageScanner`.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Navigate to a URL and extract cookies, storage and links.
    async fn load_page(&self, url: &str) -> Result<PageScan>;

    /// Cheap liveness probe used by the pool's health sweep.
    async fn is_healthy(&self) -> bool;

    /// Close the underlying engine process. Safe to call more than once.
    async fn close(&mut self);
}

/// Launches fresh browser engines for the pool.
#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Browser>>;
}

/// A browser engine driven over the WebDriver protocol.
pub struct WebDriverBrowser {
    driver: Option<WebDriver>,
}

#[derive(Debug, Deserialize)]
struct RawStorageItem {
    kind: String,
    key: String,
    size: usize,
}

impl WebDriverBrowser {
    /// Connect a new WebDriver session per the configured settings.
    pub async fn connect(settings: &BrowserSettings) -> Result<Self> {
        let mut caps = DesiredCapabilities::chrome();

        if settings.headless {
            caps.set_headless()?;
        }
        caps.add_arg("--disable-dev-shm-usage")?;
        caps.add_arg("--window-size=1920,1080")?;

        let driver = WebDriver::new(&settings.webdriver_url, caps)
            .await
            .context(format!(
                "Failed to connect to WebDriver at {}",
                settings.webdriver_url
            ))?;

        driver
            .set_page_load_timeout(Duration::from_secs(settings.page_load_timeout_secs))
            .await?;

        debug!("Browser session created");

        Ok(Self {
            driver: Some(driver),
        })
    }

    fn driver(&self) -> Result<&WebDriver> {
        self.driver.as_ref().context("Browser session already closed")
    }

    /// Names of cookies visible to page scripts. Cookies reported by the
    /// driver but absent here are HttpOnly.
    async fn script_visible_cookie_names(&self, driver: &WebDriver) -> HashSet<String> {
        let ret = match driver.execute("return document.cookie;", Vec::new()).await {
            Ok(ret) => ret,
            Err(_) => return HashSet::new(),
        };

        ret.json()
            .as_str()
            .map(|raw| {
                raw.split(';')
                    .filter_map(|pair| pair.trim().split('=').next())
                    .filter(|name| !name.is_empty())
                    .map(|name| name.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn extract_cookies(&self, driver: &WebDriver) -> Result<Vec<PageCookie>> {
        let cookies = driver
            .get_cookies()
            .await
            .context("Failed to read cookies")?;

        let visible = self.script_visible_cookie_names(driver).await;

        let mut out = Vec::with_capacity(cookies.len());
        for cookie in cookies {
            let raw = serde_json::to_value(&cookie)
                .context("Failed to serialize cookie")?;

            let name = raw
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                continue;
            }

            let value_size = raw
                .get("value")
                .map(|v| match v {
                    serde_json::Value::String(s) => s.len(),
                    other => other.to_string().len(),
                })
                .unwrap_or(0);

            // Prefer the driver's httpOnly flag where the implementation
            // reports one; otherwise infer it from script visibility.
            let http_only = raw
                .get("httpOnly")
                .and_then(|v| v.as_bool())
                .unwrap_or_else(|| !visible.contains(&name));

            out.push(PageCookie {
                domain: raw
                    .get("domain")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                path: raw
                    .get("path")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                expires_at: raw.get("expiry").and_then(|v| v.as_i64()),
                value_size,
                http_only,
                secure: raw.get("secure").and_then(|v| v.as_bool()).unwrap_or(false),
                same_site: raw
                    .get("sameSite")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                name,
            });
        }

        Ok(out)
    }

    async fn extract_storage(&self, driver: &WebDriver) -> Result<Vec<PageStorageItem>> {
        let ret = driver
            .execute(STORAGE_SCRIPT, Vec::new())
            .await
            .context("Failed to read web storage")?;

        let raw: Vec<RawStorageItem> = serde_json::from_value(ret.json().clone())
            .context("Failed to parse web storage result")?;

        Ok(raw
            .into_iter()
            .map(|item| PageStorageItem {
                kind: if item.kind == "session" {
                    StorageKind::Session
                } else {
                    StorageKind::Local
                },
                key: item.key,
                value_size: item.size,
            })
            .collect())
    }

    async fn extract_links(&self, driver: &WebDriver) -> Result<Vec<String>> {
        let elements = driver
            .find_all(By::Tag("a"))
            .await
            .context("Failed to find link elements")?;

        let mut links = Vec::new();
        for element in elements {
            if let Ok(Some(href)) = element.attr("href").await {
                links.push(href);
            }
        }

        Ok(links)
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn load_page(&self, url: &str) -> Result<PageScan> {
        let driver = self.driver()?;

        debug!("Navigating to: {}", url);
        driver
            .goto(url)
            .await
            .context(format!("Failed to navigate to URL: {}", url))?;

        // Give late tag-manager scripts a moment to set their cookies.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let cookies = self.extract_cookies(driver).await?;
        let storage = self.extract_storage(driver).await?;
        let links = self.extract_links(driver).await?;

        Ok(PageScan {
            url: url.to_string(),
            cookies,
            storage,
            links,
        })
    }

    async fn is_healthy(&self) -> bool {
        match &self.driver {
            Some(driver) => driver.title().await.is_ok(),
            None => false,
        }
    }

    async fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
            }
            debug!("Browser session closed");
        }
    }
}

impl Drop for WebDriverBrowser {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // Quit asynchronously so drop never blocks the runtime.
            tokio::spawn(async move {
                if let Err(e) = driver.quit().await {
                    error!("Error closing browser session during drop: {}", e);
                }
            });
        }
    }
}

/// Factory producing WebDriver-backed browsers for the pool.
pub struct WebDriverFactory {
    settings: BrowserSettings,
}

impl WebDriverFactory {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BrowserFactory for WebDriverFactory {
    async fn launch(&self) -> Result<Box<dyn Browser>> {
        let browser = WebDriverBrowser::connect(&self.settings).await?;
        Ok(Box::new(browser))
    }
}
