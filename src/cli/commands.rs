use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::browser::instance::WebDriverFactory;
use crate::browser::pool::BrowserPool;
use crate::browser::scanner::PoolScanner;
use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::cli::config::ScannerConfig;
use crate::crawler::{
    CancelHandle, CrawlError, CrawlEvent, CrawlResult, DirectCrawler, LinkDiscovery,
    ScaledCrawler, ScaledParams,
};
use crate::lock::{LockBackendFactory, LockService};
use crate::scheduler::{
    EngineCrawlRunner, JobHistory, PgJobHistory, PgScheduleRegistry, ScanScheduler,
    ScheduleRegistry, ScheduleWatcher,
};

fn load_config(profile: Option<String>) -> Result<ScannerConfig> {
    match profile {
        Some(profile) => ScannerConfig::load_profile(&profile)
            .context(format!("Failed to load profile: {}", profile)),
        None => ScannerConfig::load_default(),
    }
}

/// Bring up the browser pool and a scanner over it.
async fn connect_browser(config: &ScannerConfig) -> (Arc<BrowserPool>, Arc<PoolScanner>) {
    let factory = Arc::new(WebDriverFactory::new(config.browser.clone()));
    let pool = BrowserPool::new(config.browser.pool.clone(), factory);
    pool.start_health_loop().await;

    let scanner = Arc::new(PoolScanner::new(
        Arc::clone(&pool),
        Duration::from_secs(config.crawl.page_timeout_secs),
    ));

    (pool, scanner)
}

/// Log crawl lifecycle events as they arrive.
fn progress_printer() -> (UnboundedSender<CrawlEvent>, JoinHandle<()>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                CrawlEvent::Started { total_pages } => {
                    info!("Scanning {} pages", total_pages);
                }
                CrawlEvent::Progress(p) => {
                    info!(
                        "Progress: {}/{} pages ({} failed), {} cookies, {:.1} pages/s",
                        p.scanned_pages + p.failed_pages,
                        p.total_pages,
                        p.failed_pages,
                        p.cookies_found,
                        p.pages_per_second
                    );
                }
                CrawlEvent::Completed { .. } => {}
                CrawlEvent::Failed { error } => {
                    warn!("Crawl failed: {}", error);
                }
            }
        }
    });

    (tx, task)
}

/// Emit the report as pretty JSON, to a file or stdout.
fn write_report(result: &CrawlResult, output: Option<PathBuf>) -> Result<()> {
    let report =
        serde_json::to_string_pretty(result).context("Failed to serialize crawl report")?;

    match output {
        Some(path) => {
            fs::write(&path, report)
                .context(format!("Failed to write report to {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", report),
    }

    info!(
        "Scan finished: {} pages scanned, {} failed, {} cookies, {} storage entries",
        result.pages_scanned,
        result.pages_failed,
        result.cookies.len(),
        result.storage.len()
    );

    Ok(())
}

/// Quick scan of the entry page or an explicit page list
pub async fn scan(
    url: String,
    pages: Vec<String>,
    profile: Option<String>,
    concurrency: Option<usize>,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(profile)?;
    if let Some(c) = concurrency {
        config.crawl.concurrency = c;
    }

    let (pool, scanner) = connect_browser(&config).await;
    let crawler = DirectCrawler::new(scanner);

    let (events, printer) = progress_printer();
    let result = crawler
        .run(&url, pages, config.crawl.concurrency, Some(events))
        .await;

    pool.shutdown().await;
    printer.abort();

    write_report(&result?, output)
}

/// Full-site scan with discovery, checkpointing and resume
pub async fn deep_scan(
    url: String,
    profile: Option<String>,
    max_pages: Option<usize>,
    chunk_size: Option<usize>,
    resume: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(profile)?;
    if let Some(m) = max_pages {
        config.crawl.max_pages = m;
    }
    if let Some(c) = chunk_size {
        config.crawl.chunk_size = c;
    }

    let (job_id, resuming) = match resume {
        Some(id) => (id, true),
        None => (Uuid::new_v4().to_string(), false),
    };

    let (pool, scanner) = connect_browser(&config).await;

    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::new(config.checkpoint.resolve_dir())?);

    let params = ScaledParams {
        max_pages: config.crawl.max_pages,
        chunk_size: config.crawl.chunk_size,
        checkpoint_interval: config.crawl.checkpoint_interval,
        pool_size: config.browser.pool.pool_size,
        pages_per_instance: config.browser.pool.pages_per_instance,
    };

    let discovery = LinkDiscovery::new(
        scanner.clone(),
        &config.crawl.exclude_patterns,
        config.crawl.discovery_depth,
        params.pool_size * params.pages_per_instance,
    );

    let crawler = ScaledCrawler::new(scanner, discovery, checkpoints, params);

    // First Ctrl-C checkpoints and stops cleanly.
    let cancel = CancelHandle::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing current pages and checkpointing...");
                cancel.cancel();
            }
        })
    };

    let (events, printer) = progress_printer();
    let result = crawler
        .run(&url, &job_id, resuming, Some(events), &cancel)
        .await;

    interrupt.abort();
    printer.abort();
    pool.shutdown().await;

    match result {
        Ok(result) => write_report(&result, output),
        Err(CrawlError::Cancelled) => {
            info!(
                "Scan interrupted. Resume with: scanner deep-scan {} --resume {}",
                url, job_id
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Run the scheduler daemon until interrupted
pub async fn daemon(profile: Option<String>) -> Result<()> {
    let config = load_config(profile)?;

    let registry: Arc<dyn ScheduleRegistry> =
        Arc::new(PgScheduleRegistry::new(&config.scheduler.database_url).await?);
    let history: Arc<dyn JobHistory> =
        Arc::new(PgJobHistory::new(&config.scheduler.database_url).await?);

    let backend = LockBackendFactory::create(&config.lock).await?;
    let locks = Arc::new(LockService::new(backend, &config.lock.key_prefix));

    let (pool, scanner) = connect_browser(&config).await;
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::new(config.checkpoint.resolve_dir())?);

    let runner = Arc::new(EngineCrawlRunner::new(
        scanner,
        checkpoints,
        config.crawl.clone(),
        config.browser.pool.clone(),
    ));

    let scheduler = ScanScheduler::new(
        Arc::clone(&registry),
        Arc::clone(&history),
        locks,
        runner,
        Duration::from_secs(config.lock.ttl_secs),
    );

    let watcher = ScheduleWatcher::new(
        registry,
        Arc::clone(&scheduler),
        Duration::from_secs(config.scheduler.poll_interval_secs),
    );
    let watcher_task = tokio::spawn(async move { watcher.run().await });

    // Daily purge of history entries past the retention window.
    let retention_task = {
        let history = Arc::clone(&history);
        let retention_days = config.scheduler.history_retention_days;
        tokio::spawn(async move {
            loop {
                let cutoff = Utc::now() - chrono::Duration::days(retention_days);
                match history.delete_older_than(cutoff).await {
                    Ok(removed) if removed > 0 => {
                        info!("Purged {} job history entries", removed);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("History retention sweep failed: {e:#}"),
                }
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
            }
        })
    };

    info!("Scheduler daemon running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down scheduler daemon");
    watcher_task.abort();
    retention_task.abort();
    scheduler.shutdown().await;
    pool.shutdown().await;

    Ok(())
}

/// Show schedule execution history
pub async fn history(
    schedule_id: Option<String>,
    limit: i64,
    stats: bool,
    profile: Option<String>,
) -> Result<()> {
    let config = load_config(profile)?;
    let history = PgJobHistory::new(&config.scheduler.database_url).await?;

    if stats {
        let schedule_id = schedule_id
            .context("--stats requires a schedule id")?;
        let stats = history.stats_for_schedule(&schedule_id).await?;

        println!("Schedule: {}", schedule_id);
        println!("Total runs: {}", stats.total);
        println!("Succeeded: {}", stats.succeeded);
        println!("Failed: {}", stats.failed);
        println!("Skipped: {}", stats.skipped);
        if let Some(avg) = stats.average_duration_seconds {
            println!("Average duration: {:.1}s", avg);
        }
        return Ok(());
    }

    let executions = match schedule_id {
        Some(id) => history.list_for_schedule(&id, limit).await?,
        None => {
            let now = Utc::now();
            history.list_between(now - chrono::Duration::days(7), now).await?
        }
    };

    if executions.is_empty() {
        println!("No executions found");
        return Ok(());
    }

    for execution in executions {
        let duration = execution
            .duration_seconds
            .map(|d| format!("{:.1}s", d))
            .unwrap_or_else(|| "-".to_string());
        let detail = match (&execution.pages_scanned, &execution.error) {
            (_, Some(error)) => error.clone(),
            (Some(pages), None) => format!(
                "{} pages, {} cookies",
                pages,
                execution.cookies_found.unwrap_or(0)
            ),
            _ => String::new(),
        };

        println!(
            "{}  {:<10}  {:<9}  {}  {}",
            execution.started_at.format("%Y-%m-%d %H:%M:%S"),
            execution.schedule_id,
            execution.status.as_str(),
            duration,
            detail
        );
    }

    Ok(())
}

/// List all available configuration profiles
pub async fn list_profiles() -> Result<()> {
    let profiles = ScannerConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Manage a specific configuration profile
pub async fn manage_profile(profile_name: String) -> Result<()> {
    match ScannerConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{:#?}", config);
        }
        Err(_) => {
            warn!(
                "Profile '{}' does not exist. Creating a default profile.",
                profile_name
            );
            let config = ScannerConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub async fn show_config() -> Result<()> {
    let config = ScannerConfig::load_default()?;
    println!("Current configuration:");
    println!("{:#?}", config);

    Ok(())
}
