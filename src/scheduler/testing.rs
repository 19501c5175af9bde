use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::scheduler::history::{ExecutionStats, ExecutionStatus, JobExecution, JobHistory};
use crate::scheduler::registry::{Schedule, ScheduleRegistry};

/// In-memory schedule registry for scheduler and watcher tests.
pub struct MemoryScheduleRegistry {
    schedules: Mutex<Vec<Schedule>>,
    runs: Mutex<Vec<(String, Option<DateTime<Utc>>, String)>>,
}

impl MemoryScheduleRegistry {
    pub fn new(schedules: Vec<Schedule>) -> Self {
        Self {
            schedules: Mutex::new(schedules),
            runs: Mutex::new(Vec::new()),
        }
    }

    pub async fn replace(&self, schedules: Vec<Schedule>) {
        *self.schedules.lock().await = schedules;
    }

    /// Every record_run call as (schedule_id, next_run, last_status).
    pub async fn recorded_runs(&self) -> Vec<(String, Option<DateTime<Utc>>, String)> {
        self.runs.lock().await.clone()
    }
}

#[async_trait]
impl ScheduleRegistry for MemoryScheduleRegistry {
    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        Ok(self.schedules.lock().await.clone())
    }

    async fn record_run(
        &self,
        schedule_id: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
        last_status: &str,
    ) -> Result<()> {
        self.runs
            .lock()
            .await
            .push((schedule_id.to_string(), next_run, last_status.to_string()));

        let mut schedules = self.schedules.lock().await;
        if let Some(schedule) = schedules.iter_mut().find(|s| s.id == schedule_id) {
            schedule.last_run = Some(last_run);
            schedule.next_run = next_run;
            schedule.last_status = Some(last_status.to_string());
        }

        Ok(())
    }
}

/// In-memory job history for scheduler tests.
#[derive(Default)]
pub struct MemoryJobHistory {
    entries: Mutex<Vec<JobExecution>>,
}

impl MemoryJobHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<JobExecution> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl JobHistory for MemoryJobHistory {
    async fn record_started(&self, execution: &JobExecution) -> Result<()> {
        self.entries.lock().await.push(execution.clone());
        Ok(())
    }

    async fn record_finished(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        pages_scanned: Option<i64>,
        cookies_found: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.id == execution_id && e.status == ExecutionStatus::Started)
        {
            entry.status = status;
            entry.finished_at = Some(Utc::now());
            entry.duration_seconds =
                Some((Utc::now() - entry.started_at).num_milliseconds() as f64 / 1000.0);
            entry.pages_scanned = pages_scanned;
            entry.cookies_found = cookies_found;
            entry.error = error.map(|e| e.to_string());
        }
        Ok(())
    }

    async fn list_for_schedule(
        &self,
        schedule_id: &str,
        limit: i64,
    ) -> Result<Vec<JobExecution>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|e| e.schedule_id == schedule_id)
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<JobExecution>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|e| e.started_at >= from && e.started_at < to)
            .cloned()
            .collect())
    }

    async fn stats_for_schedule(&self, schedule_id: &str) -> Result<ExecutionStats> {
        let entries = self.entries.lock().await;
        let relevant: Vec<_> = entries
            .iter()
            .filter(|e| e.schedule_id == schedule_id)
            .collect();

        let durations: Vec<f64> = relevant
            .iter()
            .filter(|e| e.status == ExecutionStatus::Success)
            .filter_map(|e| e.duration_seconds)
            .collect();

        Ok(ExecutionStats {
            total: relevant.len() as i64,
            succeeded: relevant
                .iter()
                .filter(|e| e.status == ExecutionStatus::Success)
                .count() as i64,
            failed: relevant
                .iter()
                .filter(|e| e.status == ExecutionStatus::Failed)
                .count() as i64,
            skipped: relevant
                .iter()
                .filter(|e| e.status == ExecutionStatus::Skipped)
                .count() as i64,
            average_duration_seconds: if durations.is_empty() {
                None
            } else {
                Some(durations.iter().sum::<f64>() / durations.len() as f64)
            },
        })
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.started_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }
}

/// Watcher end-to-end check lives here so it can use both doubles.
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::crawler::CrawlResult;
    use crate::lock::{LockService, MemoryLockBackend};
    use crate::scheduler::registry::{CrawlParams, CrawlType, Frequency, TimeConfig};
    use crate::scheduler::runner::{CrawlRunner, ScanScheduler};
    use crate::scheduler::watcher::ScheduleWatcher;

    struct NoopRunner;

    #[async_trait]
    impl CrawlRunner for NoopRunner {
        async fn run_crawl(&self, schedule: &Schedule) -> Result<CrawlResult> {
            let aggregator = crate::crawler::types::ResultAggregator::new(&schedule.site);
            Ok(aggregator.into_result(
                "noop".to_string(),
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

    #[tokio::test]
    async fn watcher_applies_registry_changes() {
        let registry = Arc::new(MemoryScheduleRegistry::new(vec![schedule("s1")]));
        let history = Arc::new(MemoryJobHistory::new());
        let locks = Arc::new(LockService::new(
            Arc::new(MemoryLockBackend::new()),
            "test:lock",
        ));
        let scheduler = ScanScheduler::new(
            registry.clone(),
            history,
            locks,
            Arc::new(NoopRunner),
            Duration::from_secs(60),
        );

        let watcher = ScheduleWatcher::new(
            registry.clone(),
            Arc::clone(&scheduler),
            Duration::from_secs(60),
        );

        watcher.poll_once().await;
        assert_eq!(scheduler.trigger_count().await, 1);

        registry
            .replace(vec![schedule("s1"), schedule("s2")])
            .await;
        watcher.poll_once().await;
        assert_eq!(scheduler.trigger_count().await, 2);

        registry.replace(vec![schedule("s2")]).await;
        watcher.poll_once().await;
        assert_eq!(scheduler.trigger_count().await, 1);

        scheduler.shutdown().await;
    }
}
