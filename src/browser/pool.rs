use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::instance::{Browser, BrowserFactory};
use crate::cli::config::PoolSettings;

/// A pool-owned browser engine with lifecycle bookkeeping.
pub struct PooledBrowser {
    id: Uuid,
    browser: Box<dyn Browser>,
    created_at: Instant,
    last_used: Instant,
    use_count: u32,
    healthy: bool,
}

impl PooledBrowser {
    fn new(browser: Box<dyn Browser>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            browser,
            created_at: now,
            last_used: now,
            use_count: 0,
            healthy: true,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn browser(&self) -> &dyn Browser {
        self.browser.as_ref()
    }

    /// Flag the instance so it is recycled instead of reused.
    pub fn flag_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// True when the instance must be recycled rather than handed out again.
    fn expired(&self, settings: &PoolSettings) -> bool {
        !self.healthy
            || self.use_count >= settings.max_uses
            || self.created_at.elapsed() >= Duration::from_secs(settings.max_lifetime_secs)
            || self.last_used.elapsed() >= Duration::from_secs(settings.max_idle_secs)
    }

    async fn close(mut self) {
        self.browser.close().await;
    }
}

/// Fixed-size pool of long-lived browser engines.
///
/// Instances are created lazily up to `pool_size`; `checkout` suspends on a
/// semaphore when the pool is exhausted. A background sweep replaces
/// unhealthy or aged-out idle instances; checked-out instances are vetted on
/// return. A recycled instance is closed before its slot becomes available
/// again, so a dead engine is never handed to a caller.
pub struct BrowserPool {
    settings: PoolSettings,
    factory: Arc<dyn BrowserFactory>,
    idle: Mutex<VecDeque<PooledBrowser>>,
    slots: Arc<Semaphore>,
    shutting_down: AtomicBool,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl BrowserPool {
    pub fn new(settings: PoolSettings, factory: Arc<dyn BrowserFactory>) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(settings.pool_size.max(1)));
        Arc::new(Self {
            settings,
            factory,
            idle: Mutex::new(VecDeque::new()),
            slots,
            shutting_down: AtomicBool::new(false),
            health_task: Mutex::new(None),
        })
    }

    /// Spawn the periodic health sweep for idle instances.
    pub async fn start_health_loop(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let interval = Duration::from_secs(self.settings.health_check_interval_secs.max(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately, skip it
            loop {
                ticker.tick().await;
                if pool.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                pool.health_sweep().await;
            }
        });

        *self.health_task.lock().await = Some(task);
    }

    /// Check out a browser instance, suspending until one is available.
    pub async fn checkout(&self) -> Result<PooledBrowser> {
        if self.shutting_down.load(Ordering::SeqCst) {
            anyhow::bail!("browser pool is shut down");
        }

        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .context("browser pool closed")?;
        permit.forget();

        let mut idle = self.idle.lock().await;
        while let Some(instance) = idle.pop_front() {
            if instance.expired(&self.settings) {
                debug!("Recycling expired browser instance {}", instance.id);
                instance.close().await;
                continue;
            }
            let mut instance = instance;
            instance.use_count += 1;
            instance.last_used = Instant::now();
            return Ok(instance);
        }
        drop(idle);

        match self.factory.launch().await {
            Ok(browser) => {
                let mut instance = PooledBrowser::new(browser);
                instance.use_count = 1;
                debug!("Created browser instance {}", instance.id);
                Ok(instance)
            }
            Err(e) => {
                // Give the slot back so a later checkout can retry.
                self.slots.add_permits(1);
                Err(e.context("failed to launch browser instance"))
            }
        }
    }

    /// Return a checked-out instance. An instance past its use/age budget
    /// (or flagged unhealthy) is closed here; its slot is refilled lazily by
    /// the next checkout.
    pub async fn give_back(&self, mut instance: PooledBrowser) {
        instance.last_used = Instant::now();

        if self.shutting_down.load(Ordering::SeqCst) || instance.expired(&self.settings) {
            debug!(
                "Closing browser instance {} after {} uses",
                instance.id, instance.use_count
            );
            instance.close().await;
        } else {
            self.idle.lock().await.push_back(instance);
        }

        self.slots.add_permits(1);
    }

    /// Close idle instances that are expired or fail the liveness probe.
    pub async fn health_sweep(&self) {
        let mut idle = self.idle.lock().await;
        let mut keep = VecDeque::with_capacity(idle.len());

        while let Some(mut instance) = idle.pop_front() {
            if instance.expired(&self.settings) {
                debug!("Health sweep: recycling expired instance {}", instance.id);
                instance.close().await;
            } else if !instance.browser.is_healthy().await {
                warn!("Health sweep: instance {} failed health check", instance.id);
                instance.flag_unhealthy();
                instance.close().await;
            } else {
                keep.push_back(instance);
            }
        }

        *idle = keep;
    }

    /// Drain and close every idle instance; checked-out instances are closed
    /// as they come back. No engine process outlives the pool.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        if let Some(task) = self.health_task.lock().await.take() {
            task.abort();
        }

        let mut idle = self.idle.lock().await;
        let count = idle.len();
        while let Some(instance) = idle.pop_front() {
            instance.close().await;
        }

        info!("Browser pool shut down, {} idle instances closed", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    use crate::crawler::types::PageScan;

    struct StubBrowser {
        healthy: Arc<AtomicBool>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Browser for StubBrowser {
        async fn load_page(&self, url: &str) -> Result<PageScan> {
            Ok(PageScan {
                url: url.to_string(),
                cookies: vec![],
                storage: vec![],
                links: vec![],
            })
        }

        async fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StubFactory {
        launched: Arc<AtomicUsize>,
        healthy: Arc<AtomicBool>,
        closed: Arc<AtomicUsize>,
    }

    impl StubFactory {
        fn new() -> Self {
            Self {
                launched: Arc::new(AtomicUsize::new(0)),
                healthy: Arc::new(AtomicBool::new(true)),
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl BrowserFactory for StubFactory {
        async fn launch(&self) -> Result<Box<dyn Browser>> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubBrowser {
                healthy: self.healthy.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    fn settings(pool_size: usize, max_uses: u32) -> PoolSettings {
        PoolSettings {
            pool_size,
            pages_per_instance: 4,
            max_uses,
            max_lifetime_secs: 3600,
            max_idle_secs: 3600,
            health_check_interval_secs: 60,
        }
    }

    #[tokio::test]
    async fn instance_recycled_after_max_uses() {
        let factory = Arc::new(StubFactory::new());
        let launched = factory.launched.clone();
        let pool = BrowserPool::new(settings(3, 10), factory);

        let first_id = {
            let instance = pool.checkout().await.unwrap();
            let id = instance.id();
            pool.give_back(instance).await;
            id
        };

        for _ in 0..9 {
            let instance = pool.checkout().await.unwrap();
            assert_eq!(instance.id(), first_id);
            pool.give_back(instance).await;
        }
        assert_eq!(launched.load(Ordering::SeqCst), 1);

        // 10 uses consumed; the next checkout must get a fresh instance with
        // a restarted use counter.
        let fresh = pool.checkout().await.unwrap();
        assert_ne!(fresh.id(), first_id);
        assert_eq!(fresh.use_count(), 1);
        assert_eq!(launched.load(Ordering::SeqCst), 2);
        pool.give_back(fresh).await;
    }

    #[tokio::test]
    async fn checkout_blocks_when_exhausted() {
        let pool = BrowserPool::new(settings(1, 100), Arc::new(StubFactory::new()));

        let held = pool.checkout().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(20), pool.checkout()).await;
        assert!(blocked.is_err(), "checkout should suspend while exhausted");

        pool.give_back(held).await;
        let again = pool.checkout().await.unwrap();
        pool.give_back(again).await;
    }

    #[tokio::test]
    async fn health_sweep_replaces_unhealthy_idle_instance() {
        let factory = Arc::new(StubFactory::new());
        let launched = factory.launched.clone();
        let healthy = factory.healthy.clone();
        let closed = factory.closed.clone();
        let pool = BrowserPool::new(settings(2, 100), factory);

        let instance = pool.checkout().await.unwrap();
        let sick_id = instance.id();
        pool.give_back(instance).await;

        healthy.store(false, Ordering::SeqCst);
        pool.health_sweep().await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        healthy.store(true, Ordering::SeqCst);
        let replacement = pool.checkout().await.unwrap();
        assert_ne!(replacement.id(), sick_id);
        assert_eq!(launched.load(Ordering::SeqCst), 2);
        pool.give_back(replacement).await;
    }

    #[tokio::test]
    async fn shutdown_closes_idle_and_rejects_checkout() {
        let factory = Arc::new(StubFactory::new());
        let closed = factory.closed.clone();
        let pool = BrowserPool::new(settings(2, 100), factory);

        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();
        pool.give_back(a).await;
        pool.give_back(b).await;

        pool.shutdown().await;
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(pool.checkout().await.is_err());
    }

    #[tokio::test]
    async fn flagged_instance_is_not_reused() {
        let factory = Arc::new(StubFactory::new());
        let launched = factory.launched.clone();
        let pool = BrowserPool::new(settings(1, 100), factory);

        let mut instance = pool.checkout().await.unwrap();
        let id = instance.id();
        instance.flag_unhealthy();
        pool.give_back(instance).await;

        let fresh = pool.checkout().await.unwrap();
        assert_ne!(fresh.id(), id);
        assert_eq!(launched.load(Ordering::SeqCst), 2);
        pool.give_back(fresh).await;
    }
}
