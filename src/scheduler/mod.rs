pub mod history;
pub mod registry;
pub mod runner;
pub mod triggers;
pub mod watcher;

#[cfg(test)]
pub mod testing;

// Re-export common types
pub use history::{ExecutionStats, ExecutionStatus, JobExecution, JobHistory, PgJobHistory};
pub use registry::{
    CrawlParams, CrawlType, Frequency, PgScheduleRegistry, Schedule, ScheduleRegistry, TimeConfig,
};
pub use runner::{CrawlRunner, EngineCrawlRunner, FireOutcome, ScanScheduler};
pub use triggers::next_fire;
pub use watcher::{content_hash, ScheduleWatcher};
