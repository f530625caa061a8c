//! SQLite durable store
//!
//! System of record for completed history: async job records, the
//! append-only cost ledger and per-channel running totals. Everything
//! else the gateway holds is reconstructable cache.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

use crate::poller::JobState;

/// Durable async job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub upstream_task_id: String,
    pub tenant: String,
    pub user_id: String,
    pub channel_id: String,
    pub model: String,
    pub prompt: String,
    pub status: JobState,
    pub progress: u8,
    pub video_url: Option<String>,
    pub image_url: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One row of the append-only cost ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub request_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub model: String,
    pub prompt_units: u64,
    pub completion_units: u64,
    pub total_units: u64,
    pub cost: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub latency_ms: i64,
    pub status: String,
    pub http_status: Option<u16>,
    pub error_message: Option<String>,
}

/// Aggregate spend for one channel, read from the ledger
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSpend {
    pub channel_id: String,
    pub total_calls: i64,
    pub total_cost: f64,
}

pub struct GatewayDb {
    pool: SqlitePool,
}

impl GatewayDb {
    /// Open (or create) the database and run migrations
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal) // concurrent reads while the poller writes
            .busy_timeout(Duration::from_secs(30))
            .pragma("synchronous", "NORMAL");

        // An in-memory database exists per connection, so the pool must
        // stay at one connection for it to be coherent.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .context("Failed to connect to gateway database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run gateway database migrations")?;

        Ok(Self { pool })
    }

    // ---------- jobs ----------

    pub async fn insert_job(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (job_id, upstream_task_id, tenant, user_id, channel_id, model, prompt,
                               status, progress, video_url, image_url, error_message, error_code,
                               created_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.job_id)
        .bind(&job.upstream_task_id)
        .bind(&job.tenant)
        .bind(&job.user_id)
        .bind(&job.channel_id)
        .bind(&job.model)
        .bind(&job.prompt)
        .bind(job.status.as_str())
        .bind(job.progress as i64)
        .bind(&job.video_url)
        .bind(&job.image_url)
        .bind(&job.error_message)
        .bind(&job.error_code)
        .bind(job.created_at.to_rfc3339())
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .context("Failed to insert job")?;

        Ok(())
    }

    /// Apply one poll cycle's observation. Terminal states also stamp
    /// `completed_at`; the caller guarantees a job goes terminal only once.
    pub async fn update_job_status(
        &self,
        job_id: &str,
        status: JobState,
        progress: u8,
        video_url: Option<&str>,
        image_url: Option<&str>,
        error_message: Option<&str>,
        error_code: Option<&str>,
    ) -> Result<()> {
        let completed_at = if status.is_terminal() {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };

        sqlx::query(
            "UPDATE jobs
             SET status = ?,
                 progress = ?,
                 video_url = COALESCE(?, video_url),
                 image_url = COALESCE(?, image_url),
                 error_message = ?,
                 error_code = ?,
                 completed_at = COALESCE(?, completed_at)
             WHERE job_id = ?",
        )
        .bind(status.as_str())
        .bind(progress as i64)
        .bind(video_url)
        .bind(image_url)
        .bind(error_message)
        .bind(error_code)
        .bind(completed_at)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to update job status")?;

        Ok(())
    }

    /// Point the job at a new upstream task after a whole-job resubmission
    pub async fn update_job_upstream_id(&self, job_id: &str, upstream_task_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs
             SET upstream_task_id = ?, status = ?, progress = 0,
                 error_message = NULL, error_code = NULL
             WHERE job_id = ?",
        )
        .bind(upstream_task_id)
        .bind(JobState::Processing.as_str())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to update job upstream id")?;

        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            "SELECT job_id, upstream_task_id, tenant, user_id, channel_id, model, prompt,
                    status, progress, video_url, image_url, error_message, error_code,
                    created_at, completed_at
             FROM jobs WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch job")?;

        row.map(|row| {
            let status: String = row.get("status");
            let created_at: String = row.get("created_at");
            let completed_at: Option<String> = row.get("completed_at");
            Ok(JobRecord {
                job_id: row.get("job_id"),
                upstream_task_id: row.get("upstream_task_id"),
                tenant: row.get("tenant"),
                user_id: row.get("user_id"),
                channel_id: row.get("channel_id"),
                model: row.get("model"),
                prompt: row.get("prompt"),
                status: JobState::parse(&status),
                progress: row.get::<i64, _>("progress") as u8,
                video_url: row.get("video_url"),
                image_url: row.get("image_url"),
                error_message: row.get("error_message"),
                error_code: row.get("error_code"),
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                completed_at: completed_at
                    .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                    .map(|t| t.with_timezone(&Utc)),
            })
        })
        .transpose()
    }

    // ---------- cost ledger & channel totals ----------

    pub async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO cost_ledger (request_id, channel_id, user_id, model, prompt_units,
                                      completion_units, total_units, cost, started_at, finished_at,
                                      latency_ms, status, http_status, error_message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.request_id)
        .bind(&entry.channel_id)
        .bind(&entry.user_id)
        .bind(&entry.model)
        .bind(entry.prompt_units as i64)
        .bind(entry.completion_units as i64)
        .bind(entry.total_units as i64)
        .bind(entry.cost)
        .bind(entry.started_at.to_rfc3339())
        .bind(entry.finished_at.to_rfc3339())
        .bind(entry.latency_ms)
        .bind(&entry.status)
        .bind(entry.http_status.map(|s| s as i64))
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await
        .context("Failed to append ledger entry")?;

        Ok(())
    }

    pub async fn increment_channel_totals(&self, channel_id: &str, cost: f64) -> Result<()> {
        sqlx::query(
            "INSERT INTO channel_stats (channel_id, total_calls, total_cost, last_used_at)
             VALUES (?, 1, ?, ?)
             ON CONFLICT(channel_id) DO UPDATE SET
                 total_calls = total_calls + 1,
                 total_cost = total_cost + excluded.total_cost,
                 last_used_at = excluded.last_used_at",
        )
        .bind(channel_id)
        .bind(cost)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to increment channel totals")?;

        Ok(())
    }

    pub async fn channel_spend(&self, channel_id: Option<&str>) -> Result<Vec<ChannelSpend>> {
        let rows = match channel_id {
            Some(id) => {
                sqlx::query(
                    "SELECT channel_id, total_calls, total_cost
                     FROM channel_stats WHERE channel_id = ?",
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT channel_id, total_calls, total_cost
                     FROM channel_stats ORDER BY channel_id",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to query channel spend")?;

        Ok(rows
            .into_iter()
            .map(|row| ChannelSpend {
                channel_id: row.get("channel_id"),
                total_calls: row.get("total_calls"),
                total_cost: row.get("total_cost"),
            })
            .collect())
    }
}
