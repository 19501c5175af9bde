use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

/// Which crawl engine a schedule drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlType {
    Direct,
    Scaled,
}

/// How often a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Custom,
}

/// When within the frequency period a schedule fires. Fields beyond the
/// frequency's needs are ignored; weekday is 0 = Monday.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeConfig {
    #[serde(default)]
    pub minute: u32,
    #[serde(default)]
    pub hour: Option<u32>,
    #[serde(default)]
    pub weekday: Option<u32>,
    #[serde(default)]
    pub day_of_month: Option<u32>,
    /// Interval for Frequency::Custom, in minutes.
    #[serde(default)]
    pub interval_minutes: Option<u32>,
}

/// Engine parameters carried by a schedule. Absent fields fall back to the
/// daemon's configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlParams {
    /// Explicit page list for direct crawls; empty means entry page only.
    #[serde(default)]
    pub pages: Vec<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

/// A recurring crawl definition, as stored in the schedule registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub site: String,
    pub crawl_type: CrawlType,
    pub crawl_params: CrawlParams,
    pub frequency: Frequency,
    pub time_config: TimeConfig,
    pub enabled: bool,
    /// Bookkeeping written back after each run; not part of the schedule's
    /// identity.
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
}

/// Source of truth for crawl schedules, shared by every scanner node.
#[async_trait]
pub trait ScheduleRegistry: Send + Sync {
    async fn list_schedules(&self) -> Result<Vec<Schedule>>;

    /// Write back run bookkeeping after a fire attempt.
    async fn record_run(
        &self,
        schedule_id: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
        last_status: &str,
    ) -> Result<()>;
}

/// PostgreSQL implementation of ScheduleRegistry
pub struct PgScheduleRegistry {
    pool: Pool<Postgres>,
}

impl PgScheduleRegistry {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL for schedules")?;

        let registry = Self { pool };
        registry.ensure_table().await?;

        debug!("Connected to schedule registry");

        Ok(registry)
    }

    async fn ensure_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                site TEXT NOT NULL,
                crawl_type TEXT NOT NULL,
                crawl_params JSONB NOT NULL DEFAULT '{}',
                frequency TEXT NOT NULL,
                time_config JSONB NOT NULL DEFAULT '{}',
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                last_run TIMESTAMPTZ,
                next_run TIMESTAMPTZ,
                last_status TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create schedules table")?;

        Ok(())
    }

    fn parse_crawl_type(raw: &str) -> Result<CrawlType> {
        match raw {
            "direct" => Ok(CrawlType::Direct),
            "scaled" => Ok(CrawlType::Scaled),
            other => anyhow::bail!("Unknown crawl type in schedule: {}", other),
        }
    }

    fn parse_frequency(raw: &str) -> Result<Frequency> {
        match raw {
            "hourly" => Ok(Frequency::Hourly),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            "custom" => Ok(Frequency::Custom),
            other => anyhow::bail!("Unknown frequency in schedule: {}", other),
        }
    }
}

#[async_trait]
impl ScheduleRegistry for PgScheduleRegistry {
    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            "SELECT id, site, crawl_type, crawl_params, frequency, time_config,
                    enabled, last_run, next_run, last_status
             FROM schedules
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list schedules")?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in rows {
            let crawl_type: String = row.try_get("crawl_type")?;
            let frequency: String = row.try_get("frequency")?;
            let crawl_params: Json<CrawlParams> = row.try_get("crawl_params")?;
            let time_config: Json<TimeConfig> = row.try_get("time_config")?;

            schedules.push(Schedule {
                id: row.try_get("id")?,
                site: row.try_get("site")?,
                crawl_type: Self::parse_crawl_type(&crawl_type)?,
                crawl_params: crawl_params.0,
                frequency: Self::parse_frequency(&frequency)?,
                time_config: time_config.0,
                enabled: row.try_get("enabled")?,
                last_run: row.try_get("last_run")?,
                next_run: row.try_get("next_run")?,
                last_status: row.try_get("last_status")?,
            });
        }

        Ok(schedules)
    }

    async fn record_run(
        &self,
        schedule_id: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
        last_status: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE schedules
             SET last_run = $2, next_run = $3, last_status = $4
             WHERE id = $1",
        )
        .bind(schedule_id)
        .bind(last_run)
        .bind(next_run)
        .bind(last_status)
        .execute(&self.pool)
        .await
        .context(format!("Failed to record run for schedule {}", schedule_id))?;

        debug!("Recorded run for schedule {}: {}", schedule_id, last_status);

        Ok(())
    }
}
