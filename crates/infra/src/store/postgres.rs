//! Postgres-backed job record store.
//!
//! ## Claim
//!
//! The claim is a single conditional statement:
//!
//! ```sql
//! UPDATE tool_jobs
//! SET status = 'processing', attempts = attempts + 1, ...
//! WHERE id = $1 AND status = 'pending'
//! RETURNING attempts, max_attempts
//! ```
//!
//! Postgres row locking serializes concurrent claims on the same row; the
//! loser re-evaluates the `WHERE` clause against the committed row, sees
//! `processing`, and affects zero rows. No advisory locks are involved.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert only) |
//! | Database (check violation) | `23514` | `InvalidRecord` |
//! | anything else | | `Storage` |
//!
//! Rows are re-validated on load: the tool input goes back through
//! `ToolInput::from_parts`, so a row written with a mismatched schema surfaces
//! as `InvalidRecord` instead of reaching a processor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use jobforge_core::{Job, JobId, JobStatus, ToolInput, ToolSlug};

use super::{ClaimGrant, JobRecordStore, JobUpdate, StoreError, StoreResult, UpdateGuard, cutoff};

/// Table and index definitions, applied by [`PostgresJobRecordStore::migrate`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tool_jobs (
    id               UUID PRIMARY KEY,
    tool_slug        TEXT NOT NULL,
    status           TEXT NOT NULL,
    input            JSONB NOT NULL,
    output           JSONB,
    error            TEXT,
    attempts         INTEGER NOT NULL DEFAULT 0,
    max_attempts     INTEGER NOT NULL DEFAULT 3,
    priority         INTEGER NOT NULL DEFAULT 0,
    process_after    TIMESTAMPTZ,
    expires_at       TIMESTAMPTZ,
    queue_message_id TEXT,
    started_at       TIMESTAMPTZ,
    completed_at     TIMESTAMPTZ,
    created_at       TIMESTAMPTZ NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL,
    CONSTRAINT tool_jobs_attempts_check CHECK (attempts >= 0 AND max_attempts >= 1),
    CONSTRAINT tool_jobs_status_check CHECK (
        status IN ('pending', 'processing', 'completed', 'failed', 'cancelled', 'expired')
    )
);

CREATE INDEX IF NOT EXISTS tool_jobs_status_started_idx ON tool_jobs (status, started_at);
CREATE INDEX IF NOT EXISTS tool_jobs_status_updated_idx ON tool_jobs (status, updated_at);
CREATE INDEX IF NOT EXISTS tool_jobs_expires_idx ON tool_jobs (expires_at)
    WHERE expires_at IS NOT NULL;
"#;

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled', 'expired')";

const JOB_COLUMNS: &str = "id, tool_slug, status, input, output, error, attempts, max_attempts, \
    priority, process_after, expires_at, queue_message_id, started_at, completed_at, \
    created_at, updated_at";

/// Postgres-backed job record store.
///
/// Uses the SQLx connection pool, which is `Send + Sync`; clones share it.
#[derive(Debug, Clone)]
pub struct PostgresJobRecordStore {
    pool: Arc<PgPool>,
}

impl PostgresJobRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `tool_jobs` table and indexes if they do not exist.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn select_jobs(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> StoreResult<Vec<Job>> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(job_from_pg_row(&row)?);
        }
        Span::current().record("job_count", jobs.len());
        Ok(jobs)
    }
}

#[async_trait]
impl JobRecordStore for PostgresJobRecordStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, tool_slug = %job.tool_slug), err)]
    async fn insert(&self, job: &Job) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tool_jobs (
                id, tool_slug, status, input, output, error, attempts, max_attempts,
                priority, process_after, expires_at, queue_message_id, started_at,
                completed_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tool_slug.as_str())
        .bind(job.status.as_str())
        .bind(job.input.to_value())
        .bind(&job.output)
        .bind(&job.error)
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.priority)
        .bind(job.process_after)
        .bind(job.expires_at)
        .bind(&job.queue_message_id)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id, claimed), err)]
    async fn claim(&self, job_id: JobId, message_id: &str) -> StoreResult<Option<ClaimGrant>> {
        let row = sqlx::query(
            r#"
            UPDATE tool_jobs
            SET status = 'processing',
                attempts = attempts + 1,
                started_at = now(),
                queue_message_id = $2,
                updated_at = now()
            WHERE id = $1 AND status = 'pending'
            RETURNING attempts, max_attempts
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(message_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let Some(row) = row else {
            Span::current().record("claimed", false);
            return Ok(None);
        };

        let attempts: i32 = row
            .try_get("attempts")
            .map_err(|e| map_sqlx_error("claim", e))?;
        let max_attempts: i32 = row
            .try_get("max_attempts")
            .map_err(|e| map_sqlx_error("claim", e))?;

        Ok(Some(ClaimGrant {
            job_id,
            message_id: message_id.to_string(),
            attempts: attempts.max(0) as u32,
            max_attempts: max_attempts.max(1) as u32,
        }))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn find_by_id(&self, job_id: JobId) -> StoreResult<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM tool_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_id", e))?;

        row.map(|r| job_from_pg_row(&r)).transpose()
    }

    #[instrument(skip(self, update), fields(job_id = %job_id, status = ?update.status), err)]
    async fn update(&self, job_id: JobId, update: JobUpdate) -> StoreResult<bool> {
        let result = bind_update(
            sqlx::query(&format!(
                r#"
                UPDATE tool_jobs
                SET status = COALESCE($2, status),
                    output = COALESCE($3, output),
                    error = CASE WHEN $4 THEN NULL ELSE COALESCE($5, error) END,
                    completed_at = COALESCE($6, completed_at),
                    updated_at = now()
                WHERE id = $1
                  AND status NOT IN {TERMINAL_STATUSES}
                  AND ($2::text IS NULL OR status = ANY($7))
                "#
            ))
            .bind(job_id.as_uuid()),
            &update,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Zero rows: terminal record (no-op) or missing record (error).
        match self.find_by_id(job_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(job_id)),
        }
    }

    #[instrument(skip(self, guard, update), fields(job_id = %job_id, status = ?update.status), err)]
    async fn update_if(
        &self,
        job_id: JobId,
        guard: &UpdateGuard,
        update: JobUpdate,
    ) -> StoreResult<bool> {
        let result = bind_update(
            sqlx::query(&format!(
                r#"
                UPDATE tool_jobs
                SET status = COALESCE($2, status),
                    output = COALESCE($3, output),
                    error = CASE WHEN $4 THEN NULL ELSE COALESCE($5, error) END,
                    completed_at = COALESCE($6, completed_at),
                    updated_at = now()
                WHERE id = $1
                  AND status NOT IN {TERMINAL_STATUSES}
                  AND ($2::text IS NULL OR status = ANY($7))
                  AND status = $8
                  AND attempts = $9
                  AND queue_message_id IS NOT DISTINCT FROM $10
                "#
            ))
            .bind(job_id.as_uuid()),
            &update,
        )
        .bind(guard.status.as_str())
        .bind(guard.attempts as i32)
        .bind(&guard.queue_message_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_if", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(job_count), err)]
    async fn find_stuck_processing(&self, threshold: Duration) -> StoreResult<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM tool_jobs \
             WHERE status = 'processing' AND started_at < $1 \
             ORDER BY started_at ASC"
        );
        self.select_jobs("find_stuck_processing", sqlx::query(&sql).bind(cutoff(threshold)))
            .await
    }

    #[instrument(skip(self), fields(job_count), err)]
    async fn find_pending_older_than(&self, age: Duration, limit: usize) -> StoreResult<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM tool_jobs \
             WHERE status = 'pending' AND updated_at <= $1 \
             ORDER BY created_at ASC LIMIT $2"
        );
        self.select_jobs(
            "find_pending_older_than",
            sqlx::query(&sql).bind(cutoff(age)).bind(limit_param(limit)),
        )
        .await
    }

    #[instrument(skip(self), fields(job_count), err)]
    async fn find_past_deadline(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM tool_jobs \
             WHERE status NOT IN {TERMINAL_STATUSES} AND expires_at < $1 \
             ORDER BY expires_at ASC LIMIT $2"
        );
        self.select_jobs(
            "find_past_deadline",
            sqlx::query(&sql).bind(now).bind(limit_param(limit)),
        )
        .await
    }
}

fn bind_update<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    update: &JobUpdate,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.output.clone())
        .bind(update.clear_error)
        .bind(update.error.clone())
        .bind(update.completed_at)
        .bind(transition_sources(update.status))
}

/// Statuses a record may hold for `next` to be written over it.
fn transition_sources(next: Option<JobStatus>) -> Vec<&'static str> {
    let Some(next) = next else {
        return Vec::new();
    };
    JobStatus::ALL
        .into_iter()
        .filter(|current| *current == next || current.can_transition_to(next))
        .map(|current| current.as_str())
        .collect()
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => StoreError::InvalidRecord(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed during {operation}"))
        }
        other => StoreError::Storage(format!("{operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    tool_slug: String,
    status: String,
    input: JsonValue,
    output: Option<JsonValue>,
    error: Option<String>,
    attempts: i32,
    max_attempts: i32,
    priority: i32,
    process_after: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    queue_message_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tool_slug: row.try_get("tool_slug")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            priority: row.try_get("priority")?,
            process_after: row.try_get("process_after")?,
            expires_at: row.try_get("expires_at")?,
            queue_message_id: row.try_get("queue_message_id")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let tool_slug = ToolSlug::new(row.tool_slug)?;
        let status: JobStatus = row.status.parse()?;
        let input = ToolInput::from_parts(&tool_slug, row.input)?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            tool_slug,
            status,
            input,
            output: row.output,
            error: row.error,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            priority: row.priority,
            process_after: row.process_after,
            expires_at: row.expires_at,
            queue_message_id: row.queue_message_id,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn job_from_pg_row(row: &sqlx::postgres::PgRow) -> StoreResult<Job> {
    let job_row = JobRow::from_row(row)
        .map_err(|e| StoreError::InvalidRecord(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(job_row)
}
