use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::scheduler::registry::{Schedule, ScheduleRegistry};
use crate::scheduler::runner::ScanScheduler;

/// Hash of a schedule's definition, ignoring run bookkeeping. Two schedules
/// with the same hash drive the same crawl at the same times, so bookkeeping
/// writes (last_run, next_run, last_status) never restart a trigger.
pub fn content_hash(schedule: &Schedule) -> u64 {
    let identity = serde_json::json!({
        "id": schedule.id,
        "site": schedule.site,
        "crawl_type": schedule.crawl_type,
        "crawl_params": schedule.crawl_params,
        "frequency": schedule.frequency,
        "time_config": schedule.time_config,
        "enabled": schedule.enabled,
    });

    xxh3_64(identity.to_string().as_bytes())
}

/// Polls the schedule registry and reconciles the scheduler's trigger tasks
/// with whatever the registry currently holds, so schedule edits take effect
/// without a daemon restart.
pub struct ScheduleWatcher {
    registry: Arc<dyn ScheduleRegistry>,
    scheduler: Arc<ScanScheduler>,
    poll_interval: Duration,
}

impl ScheduleWatcher {
    pub fn new(
        registry: Arc<dyn ScheduleRegistry>,
        scheduler: Arc<ScanScheduler>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            scheduler,
            poll_interval,
        }
    }

    /// One reconciliation pass. A registry read failure leaves the current
    /// triggers running untouched.
    pub async fn poll_once(&self) {
        match self.registry.list_schedules().await {
            Ok(schedules) => {
                debug!("Watcher loaded {} schedules", schedules.len());
                self.scheduler.apply(&schedules).await;
            }
            Err(e) => {
                warn!("Schedule poll failed, keeping current triggers: {e:#}");
            }
        }
    }

    /// Poll forever at the configured interval. The daemon aborts this task
    /// on shutdown.
    pub async fn run(&self) {
        loop {
            self.poll_once().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
