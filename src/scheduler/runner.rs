use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::browser::scanner::PageScanner;
use crate::checkpoint::CheckpointStore;
use crate::cli::config::{CrawlSettings, PoolSettings};
use crate::crawler::{
    CancelHandle, CrawlError, CrawlResult, DirectCrawler, LinkDiscovery, ScaledCrawler,
    ScaledParams,
};
use crate::lock::LockService;
use crate::scheduler::history::{ExecutionStatus, JobExecution, JobHistory};
use crate::scheduler::registry::{CrawlType, Schedule, ScheduleRegistry};
use crate::scheduler::triggers::next_fire;
use crate::scheduler::watcher::content_hash;

/// Outcome of a single fire attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    Success {
        pages_scanned: usize,
        cookies_found: usize,
    },
    /// Another node holds the schedule's lock; nothing was run.
    Skipped,
    Cancelled,
    Failed(String),
}

impl FireOutcome {
    fn status(&self) -> ExecutionStatus {
        match self {
            FireOutcome::Success { .. } => ExecutionStatus::Success,
            FireOutcome::Skipped => ExecutionStatus::Skipped,
            FireOutcome::Cancelled => ExecutionStatus::Cancelled,
            FireOutcome::Failed(_) => ExecutionStatus::Failed,
        }
    }
}

/// Executes one crawl for a schedule. The scheduler itself stays agnostic
/// of which engine runs underneath.
#[async_trait]
pub trait CrawlRunner: Send + Sync {
    async fn run_crawl(&self, schedule: &Schedule) -> Result<CrawlResult>;
}

struct TriggerHandle {
    hash: u64,
    task: JoinHandle<()>,
}

struct SchedulerInner {
    registry: Arc<dyn ScheduleRegistry>,
    history: Arc<dyn JobHistory>,
    locks: Arc<LockService>,
    runner: Arc<dyn CrawlRunner>,
    lock_ttl: Duration,
}

/// Owns one timer task per enabled schedule and serializes fires per
/// schedule across nodes through the lock service.
///
/// A fire that finds the schedule's lock taken is recorded as skipped and
/// does not run; while a crawl runs, a keepalive re-arms the lock at half
/// its TTL so slow crawls stay covered.
pub struct ScanScheduler {
    inner: Arc<SchedulerInner>,
    triggers: Mutex<HashMap<String, TriggerHandle>>,
}

impl ScanScheduler {
    pub fn new(
        registry: Arc<dyn ScheduleRegistry>,
        history: Arc<dyn JobHistory>,
        locks: Arc<LockService>,
        runner: Arc<dyn CrawlRunner>,
        lock_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(SchedulerInner {
                registry,
                history,
                locks,
                runner,
                lock_ttl,
            }),
            triggers: Mutex::new(HashMap::new()),
        })
    }

    /// Fire a schedule immediately, outside its timer. Used by the daemon
    /// at startup for overdue schedules and by manual runs.
    pub async fn fire_now(&self, schedule: &Schedule) -> FireOutcome {
        Self::fire(&self.inner, schedule).await
    }

    /// Reconcile the running timer tasks with the given schedule set:
    /// spawn timers for new schedules, restart timers whose definition
    /// changed, and stop timers for schedules that disappeared or were
    /// disabled. Bookkeeping-only changes leave timers untouched.
    pub async fn apply(&self, schedules: &[Schedule]) {
        let mut triggers = self.triggers.lock().await;

        let mut seen: HashMap<String, u64> = HashMap::new();
        for schedule in schedules.iter().filter(|s| s.enabled) {
            seen.insert(schedule.id.clone(), content_hash(schedule));
        }

        let stale: Vec<String> = triggers
            .keys()
            .filter(|id| !seen.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(handle) = triggers.remove(&id) {
                handle.task.abort();
                info!("Stopped trigger for removed schedule {}", id);
            }
        }

        for schedule in schedules.iter().filter(|s| s.enabled) {
            let hash = seen[&schedule.id];

            match triggers.get(&schedule.id) {
                Some(existing) if existing.hash == hash => {}
                Some(_) => {
                    if let Some(old) = triggers.remove(&schedule.id) {
                        old.task.abort();
                    }
                    info!("Restarting trigger for changed schedule {}", schedule.id);
                    let task = Self::spawn_trigger(Arc::clone(&self.inner), schedule.clone());
                    triggers.insert(schedule.id.clone(), TriggerHandle { hash, task });
                }
                None => {
                    info!("Starting trigger for schedule {}", schedule.id);
                    let task = Self::spawn_trigger(Arc::clone(&self.inner), schedule.clone());
                    triggers.insert(schedule.id.clone(), TriggerHandle { hash, task });
                }
            }
        }
    }

    /// Number of live trigger tasks.
    pub async fn trigger_count(&self) -> usize {
        self.triggers.lock().await.len()
    }

    /// Abort every trigger task. In-flight fires release their locks
    /// through the normal fire path before the daemon exits.
    pub async fn shutdown(&self) {
        let mut triggers = self.triggers.lock().await;
        for (id, handle) in triggers.drain() {
            handle.task.abort();
            debug!("Stopped trigger for schedule {}", id);
        }
    }

    fn spawn_trigger(inner: Arc<SchedulerInner>, schedule: Schedule) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(fire_at) =
                    next_fire(schedule.frequency, &schedule.time_config, Utc::now())
                else {
                    warn!(
                        "Schedule {} has no computable next fire time, trigger stopping",
                        schedule.id
                    );
                    break;
                };

                let wait = (fire_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                debug!(
                    "Schedule {} next fires at {} (in {:?})",
                    schedule.id, fire_at, wait
                );
                tokio::time::sleep(wait).await;

                Self::fire(&inner, &schedule).await;
            }
        })
    }

    async fn fire(inner: &SchedulerInner, schedule: &Schedule) -> FireOutcome {
        let lock_name = format!("schedule:{}", schedule.id);
        let fired_at = Utc::now();

        let Some(token) = inner
            .locks
            .acquire(&lock_name, inner.lock_ttl, false, Duration::ZERO)
            .await
        else {
            info!(
                "Schedule {} is already running elsewhere, skipping this fire",
                schedule.id
            );

            // A skipped fire never ran, so it never passes through
            // "started": it lands in history as a skipped marker directly.
            let mut execution = JobExecution::started(&schedule.id, &schedule.site);
            execution.status = ExecutionStatus::Skipped;
            if let Err(e) = inner.history.record_started(&execution).await {
                warn!("Failed to record skipped fire for {}: {e:#}", schedule.id);
            }

            Self::record_bookkeeping(inner, schedule, &FireOutcome::Skipped, fired_at).await;
            return FireOutcome::Skipped;
        };

        let execution = JobExecution::started(&schedule.id, &schedule.site);
        if let Err(e) = inner.history.record_started(&execution).await {
            warn!("Failed to record job start for {}: {e:#}", schedule.id);
        }

        // Keep the lock alive while the crawl runs.
        let keepalive = {
            let locks = Arc::clone(&inner.locks);
            let name = lock_name.clone();
            let keepalive_token = token.clone();
            let ttl = inner.lock_ttl;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(ttl / 2).await;
                    if !locks.extend(&name, &keepalive_token, ttl).await {
                        warn!("Lost lock {} during crawl, keepalive stopping", name);
                        break;
                    }
                }
            })
        };

        let outcome = match inner.runner.run_crawl(schedule).await {
            Ok(result) => FireOutcome::Success {
                pages_scanned: result.pages_scanned,
                cookies_found: result.cookies.len(),
            },
            Err(e) => match e.downcast_ref::<CrawlError>() {
                Some(CrawlError::Cancelled) => FireOutcome::Cancelled,
                _ => {
                    error!("Scheduled crawl failed for {}: {e:#}", schedule.site);
                    FireOutcome::Failed(format!("{e:#}"))
                }
            },
        };

        keepalive.abort();
        inner.locks.release(&lock_name, &token).await;

        let (pages, cookies, error) = match &outcome {
            FireOutcome::Success {
                pages_scanned,
                cookies_found,
            } => (
                Some(*pages_scanned as i64),
                Some(*cookies_found as i64),
                None,
            ),
            FireOutcome::Failed(reason) => (None, None, Some(reason.clone())),
            FireOutcome::Skipped | FireOutcome::Cancelled => (None, None, None),
        };

        if let Err(e) = inner
            .history
            .record_finished(
                &execution.id,
                outcome.status(),
                pages,
                cookies,
                error.as_deref(),
            )
            .await
        {
            warn!("Failed to record job finish for {}: {e:#}", schedule.id);
        }

        Self::record_bookkeeping(inner, schedule, &outcome, fired_at).await;
        outcome
    }

    /// Write back the schedule's run bookkeeping. Store failures are logged,
    /// never escalated: the fire already happened.
    async fn record_bookkeeping(
        inner: &SchedulerInner,
        schedule: &Schedule,
        outcome: &FireOutcome,
        fired_at: chrono::DateTime<Utc>,
    ) {
        let next_run = next_fire(schedule.frequency, &schedule.time_config, Utc::now());
        if let Err(e) = inner
            .registry
            .record_run(
                &schedule.id,
                fired_at,
                next_run,
                outcome.status().as_str(),
            )
            .await
        {
            warn!("Failed to record run bookkeeping for {}: {e:#}", schedule.id);
        }
    }
}

/// CrawlRunner backed by the real crawl engines, dispatching on the
/// schedule's crawl type and filling parameter gaps from configuration.
pub struct EngineCrawlRunner {
    scanner: Arc<dyn PageScanner>,
    checkpoints: Arc<dyn CheckpointStore>,
    crawl: CrawlSettings,
    pool: PoolSettings,
}

impl EngineCrawlRunner {
    pub fn new(
        scanner: Arc<dyn PageScanner>,
        checkpoints: Arc<dyn CheckpointStore>,
        crawl: CrawlSettings,
        pool: PoolSettings,
    ) -> Self {
        Self {
            scanner,
            checkpoints,
            crawl,
            pool,
        }
    }
}

#[async_trait]
impl CrawlRunner for EngineCrawlRunner {
    async fn run_crawl(&self, schedule: &Schedule) -> Result<CrawlResult> {
        let params = &schedule.crawl_params;

        match schedule.crawl_type {
            CrawlType::Direct => {
                let crawler = DirectCrawler::new(Arc::clone(&self.scanner));
                let concurrency = params.concurrency.unwrap_or(self.crawl.concurrency);
                crawler
                    .run(&schedule.site, params.pages.clone(), concurrency, None)
                    .await
            }
            CrawlType::Scaled => {
                let scaled_params = ScaledParams {
                    max_pages: params.max_pages.unwrap_or(self.crawl.max_pages),
                    chunk_size: params.chunk_size.unwrap_or(self.crawl.chunk_size),
                    checkpoint_interval: self.crawl.checkpoint_interval,
                    pool_size: self.pool.pool_size,
                    pages_per_instance: self.pool.pages_per_instance,
                };

                let discovery = LinkDiscovery::new(
                    Arc::clone(&self.scanner),
                    &self.crawl.exclude_patterns,
                    self.crawl.discovery_depth,
                    scaled_params.pool_size * scaled_params.pages_per_instance,
                );

                let crawler = ScaledCrawler::new(
                    Arc::clone(&self.scanner),
                    discovery,
                    Arc::clone(&self.checkpoints),
                    scaled_params,
                );

                let job_id = Uuid::new_v4().to_string();
                let result = crawler
                    .run(&schedule.site, &job_id, false, None, &CancelHandle::new())
                    .await?;
                Ok(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::lock::MemoryLockBackend;
    use crate::scheduler::registry::{CrawlParams, Frequency, TimeConfig};
    use crate::scheduler::testing::{MemoryJobHistory, MemoryScheduleRegistry};

    /// Runner with a programmable delay and failure set.
    struct StubRunner {
        delay: Duration,
        fail: bool,
        runs: AtomicUsize,
    }

    impl StubRunner {
        fn new(delay: Duration, fail: bool) -> Self {
            Self {
                delay,
                fail,
                runs: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CrawlRunner for StubRunner {
        async fn run_crawl(&self, schedule: &Schedule) -> Result<CrawlResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("webdriver unreachable");
            }

            let aggregator = crate::crawler::types::ResultAggregator::new(&schedule.site);
            Ok(aggregator.into_result(
                "test-job".to_string(),
                schedule.site.clone(),
                Utc::now(),
            ))
        }
    }

    fn schedule(id: &str) -> Schedule {
        Schedule {
            id: id.to_string(),
            site: "https://example.com".to_string(),
            crawl_type: CrawlType::Direct,
            crawl_params: CrawlParams::default(),
            frequency: Frequency::Daily,
            time_config: TimeConfig {
                minute: 0,
                hour: Some(3),
                ..Default::default()
            },
            enabled: true,
            last_run: None,
            next_run: None,
            last_status: None,
        }
    }

    fn scheduler(runner: Arc<dyn CrawlRunner>) -> (Arc<ScanScheduler>, Arc<MemoryJobHistory>, Arc<MemoryScheduleRegistry>) {
        let registry = Arc::new(MemoryScheduleRegistry::new(vec![]));
        let history = Arc::new(MemoryJobHistory::new());
        let locks = Arc::new(LockService::new(
            Arc::new(MemoryLockBackend::new()),
            "test:lock",
        ));

        let scheduler = ScanScheduler::new(
            registry.clone(),
            history.clone(),
            locks,
            runner,
            Duration::from_secs(60),
        );

        (scheduler, history, registry)
    }

    #[tokio::test]
    async fn concurrent_fires_run_exactly_one_crawl() {
        let runner = Arc::new(StubRunner::new(Duration::from_millis(100), false));
        let (scheduler, history, _) = scheduler(runner.clone());
        let sched = schedule("s1");

        let a = {
            let scheduler = Arc::clone(&scheduler);
            let sched = sched.clone();
            tokio::spawn(async move { scheduler.fire_now(&sched).await })
        };
        let b = {
            let scheduler = Arc::clone(&scheduler);
            let sched = sched.clone();
            tokio::spawn(async move { scheduler.fire_now(&sched).await })
        };

        let outcomes = vec![a.await.unwrap(), b.await.unwrap()];
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, FireOutcome::Skipped))
                .count(),
            1
        );
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, FireOutcome::Success { .. }))
                .count(),
            1
        );

        let entries = history.entries().await;
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.status == ExecutionStatus::Success));
        assert!(entries.iter().any(|e| e.status == ExecutionStatus::Skipped));
        assert!(!entries.iter().any(|e| e.status == ExecutionStatus::Started));
    }

    #[tokio::test]
    async fn failed_crawl_is_recorded_and_lock_released() {
        let runner = Arc::new(StubRunner::new(Duration::ZERO, true));
        let (scheduler, history, registry) = scheduler(runner);
        let sched = schedule("s2");

        let outcome = scheduler.fire_now(&sched).await;
        assert!(matches!(outcome, FireOutcome::Failed(_)));

        let entries = history.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ExecutionStatus::Failed);
        assert!(entries[0].error.as_deref().unwrap().contains("webdriver"));

        // Lock released despite the failure: a second fire runs again.
        let outcome = scheduler.fire_now(&sched).await;
        assert!(matches!(outcome, FireOutcome::Failed(_)));

        // Bookkeeping written both times, with a fresh next_run.
        let runs = registry.recorded_runs().await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].2, "failed");
        assert!(runs[0].1.is_some());
    }

    #[tokio::test]
    async fn apply_reconciles_trigger_tasks() {
        let runner = Arc::new(StubRunner::new(Duration::ZERO, false));
        let (scheduler, _, _) = scheduler(runner);

        let s1 = schedule("s1");
        let mut s2 = schedule("s2");

        scheduler.apply(&[s1.clone(), s2.clone()]).await;
        assert_eq!(scheduler.trigger_count().await, 2);

        // Unchanged set: no churn.
        scheduler.apply(&[s1.clone(), s2.clone()]).await;
        assert_eq!(scheduler.trigger_count().await, 2);

        // Definition change keeps the count but replaces the task;
        // bookkeeping-only changes do not.
        s2.time_config.hour = Some(5);
        s2.last_status = Some("success".to_string());
        scheduler.apply(&[s1.clone(), s2.clone()]).await;
        assert_eq!(scheduler.trigger_count().await, 2);

        // Removal and disable both stop triggers.
        let mut s1_disabled = s1.clone();
        s1_disabled.enabled = false;
        scheduler.apply(&[s1_disabled]).await;
        assert_eq!(scheduler.trigger_count().await, 0);

        scheduler.shutdown().await;
    }
}
