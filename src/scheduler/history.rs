use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

/// Terminal (or in-flight) state of a job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Started,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Started => "started",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "started" => Ok(ExecutionStatus::Started),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "skipped" => Ok(ExecutionStatus::Skipped),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => anyhow::bail!("Unknown execution status: {}", other),
        }
    }
}

/// One audit-trail entry: a single attempt to run a scheduled crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: String,
    pub schedule_id: String,
    pub site: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub pages_scanned: Option<i64>,
    pub cookies_found: Option<i64>,
    pub error: Option<String>,
}

impl JobExecution {
    /// Fresh in-flight entry for a fire that just began.
    pub fn started(schedule_id: &str, site: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            schedule_id: schedule_id.to_string(),
            site: site.to_string(),
            status: ExecutionStatus::Started,
            started_at: Utc::now(),
            finished_at: None,
            duration_seconds: None,
            pages_scanned: None,
            cookies_found: None,
            error: None,
        }
    }
}

/// Aggregate counters over a schedule's execution history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
    pub average_duration_seconds: Option<f64>,
}

/// Append-only audit trail of schedule executions.
#[async_trait]
pub trait JobHistory: Send + Sync {
    /// Record a fire that has begun; the entry stays "started" until
    /// `record_finished` closes it.
    async fn record_started(&self, execution: &JobExecution) -> Result<()>;

    /// Close an in-flight entry with its terminal status and counters.
    async fn record_finished(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        pages_scanned: Option<i64>,
        cookies_found: Option<i64>,
        error: Option<&str>,
    ) -> Result<()>;

    async fn list_for_schedule(&self, schedule_id: &str, limit: i64)
        -> Result<Vec<JobExecution>>;

    async fn list_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<JobExecution>>;

    async fn stats_for_schedule(&self, schedule_id: &str) -> Result<ExecutionStats>;

    /// Purge entries older than the cutoff. Returns the number removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// PostgreSQL implementation of JobHistory
pub struct PgJobHistory {
    pool: Pool<Postgres>,
}

impl PgJobHistory {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL for job history")?;

        let history = Self { pool };
        history.ensure_table().await?;

        debug!("Connected to job history store");

        Ok(history)
    }

    async fn ensure_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS job_executions (
                id TEXT PRIMARY KEY,
                schedule_id TEXT NOT NULL,
                site TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ,
                duration_seconds DOUBLE PRECISION,
                pages_scanned BIGINT,
                cookies_found BIGINT,
                error TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create job_executions table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_job_executions_schedule
             ON job_executions (schedule_id, started_at DESC)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create job_executions index")?;

        Ok(())
    }

    fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<JobExecution> {
        let status: String = row.try_get("status")?;

        Ok(JobExecution {
            id: row.try_get("id")?,
            schedule_id: row.try_get("schedule_id")?,
            site: row.try_get("site")?,
            status: ExecutionStatus::parse(&status)?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            duration_seconds: row.try_get("duration_seconds")?,
            pages_scanned: row.try_get("pages_scanned")?,
            cookies_found: row.try_get("cookies_found")?,
            error: row.try_get("error")?,
        })
    }
}

#[async_trait]
impl JobHistory for PgJobHistory {
    async fn record_started(&self, execution: &JobExecution) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_executions (id, schedule_id, site, status, started_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&execution.id)
        .bind(&execution.schedule_id)
        .bind(&execution.site)
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .execute(&self.pool)
        .await
        .context("Failed to record job start")?;

        debug!(
            "Recorded job start {} for schedule {}",
            execution.id, execution.schedule_id
        );

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
        // Only an in-flight entry can be closed; closing twice is a no-op.
        sqlx::query(
            "UPDATE job_executions
             SET status = $2,
                 finished_at = NOW(),
                 duration_seconds = EXTRACT(EPOCH FROM (NOW() - started_at)),
                 pages_scanned = $3,
                 cookies_found = $4,
                 error = $5
             WHERE id = $1 AND status = 'started'",
        )
        .bind(execution_id)
        .bind(status.as_str())
        .bind(pages_scanned)
        .bind(cookies_found)
        .bind(error)
        .execute(&self.pool)
        .await
        .context(format!("Failed to record job finish for {}", execution_id))?;

        Ok(())
    }

    async fn list_for_schedule(
        &self,
        schedule_id: &str,
        limit: i64,
    ) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM job_executions
             WHERE schedule_id = $1
             ORDER BY started_at DESC
             LIMIT $2",
        )
        .bind(schedule_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list job history")?;

        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn list_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM job_executions
             WHERE started_at >= $1 AND started_at < $2
             ORDER BY started_at DESC",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list job history by time range")?;

        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn stats_for_schedule(&self, schedule_id: &str) -> Result<ExecutionStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'success') AS succeeded,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'skipped') AS skipped,
                AVG(duration_seconds) FILTER (WHERE status = 'success')
                    AS average_duration_seconds
             FROM job_executions
             WHERE schedule_id = $1",
        )
        .bind(schedule_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute job history stats")?;

        Ok(ExecutionStats {
            total: row.try_get("total")?,
            succeeded: row.try_get("succeeded")?,
            failed: row.try_get("failed")?,
            skipped: row.try_get("skipped")?,
            average_duration_seconds: row.try_get("average_duration_seconds")?,
        })
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM job_executions WHERE started_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to purge old job history")?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!("Purged {} job history entries", removed);
        }

        Ok(removed)
    }
}
