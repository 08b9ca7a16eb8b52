//! SQLite persistence for job definitions.
//!
//! The store is the source of truth for which jobs exist; run history
//! is volatile and never touches the database. Removal is a soft
//! delete: rows are marked inactive and kept.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::jobs::{JobId, JobType, NewJob, ScheduledJob};

/// Persistent job registry backed by SQLite.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Connect to the database, creating the file and schema on first run.
    ///
    /// # Errors
    ///
    /// Connection or bootstrap failure is fatal to startup; callers
    /// must not continue without a working store.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Create the schema and seed the initial rows if the database is empty.
    async fn bootstrap(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_type (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_schedule (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type_id INTEGER NOT NULL,
                schedule TEXT NOT NULL,
                details TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (type_id) REFERENCES job_type (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let type_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_type")
            .fetch_one(&self.pool)
            .await?;

        if type_count == 0 {
            info!("Empty database; seeding job types and default job");

            sqlx::query("INSERT INTO job_type (id, name) VALUES (0, 'NONE'), (1, 'WEATHER')")
                .execute(&self.pool)
                .await?;

            sqlx::query(
                "INSERT INTO job_schedule (type_id, schedule, details) VALUES (?, ?, ?)",
            )
            .bind(JobType::Weather.tag())
            .bind("*/5 * * * *")
            .bind(r#"{"location":"dublin-dublin-ireland"}"#)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Load every active job definition.
    pub async fn load_active_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query(
            "SELECT id, type_id, schedule, details FROM job_schedule WHERE active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let type_tag: i64 = row.try_get("type_id")?;
            let schedule: String = row.try_get("schedule")?;
            let details: String = row.try_get("details")?;

            // Rows with a tag this build does not know are skipped, not fatal.
            let Some(job_type) = JobType::from_tag(type_tag) else {
                warn!(job_id = id, tag = type_tag, "Skipping job with unknown type tag");
                continue;
            };

            jobs.push(ScheduledJob {
                id: JobId(id),
                job_type,
                schedule,
                details: serde_json::from_str(&details)?,
                active: true,
            });
        }

        Ok(jobs)
    }

    /// Insert a new active job and return its assigned id.
    pub async fn insert_job(&self, new: &NewJob) -> Result<JobId> {
        let details = serde_json::to_string(&new.details)?;

        let result = sqlx::query(
            "INSERT INTO job_schedule (type_id, schedule, details) VALUES (?, ?, ?)",
        )
        .bind(new.job_type.tag())
        .bind(&new.schedule)
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(JobId(result.last_insert_rowid()))
    }

    /// Mark a job inactive.
    pub async fn deactivate_job(&self, id: JobId) -> Result<()> {
        sqlx::query("UPDATE job_schedule SET active = 0 WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
