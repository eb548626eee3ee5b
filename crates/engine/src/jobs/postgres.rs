//! Postgres-backed job store (feature `postgres`).

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use storyforge_core::{JobId, UserKey};
use storyforge_providers::ModerationVerdict;

use super::store::{JobStore, JobStoreError, ModerationSide};
use super::types::{Job, JobState};
use crate::error::ErrorCode;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id               TEXT PRIMARY KEY,
    user_key         TEXT NOT NULL,
    idempotency_key  TEXT,
    spec             JSONB NOT NULL,
    status           TEXT NOT NULL,
    progress         INT NOT NULL DEFAULT 0,
    current_step     TEXT NOT NULL DEFAULT 'queued',
    moderation_input  JSONB,
    moderation_output JSONB,
    error_code       TEXT,
    error_message    TEXT,
    retry_count      INT NOT NULL DEFAULT 0,
    last_retry_at    TIMESTAMPTZ,
    created_at       TIMESTAMPTZ NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS jobs_user_idempotency
    ON jobs (user_key, idempotency_key) WHERE idempotency_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS jobs_status ON jobs (status);
CREATE INDEX IF NOT EXISTS jobs_updated_at ON jobs (updated_at);
CREATE INDEX IF NOT EXISTS jobs_user_created ON jobs (user_key, created_at);
"#;

/// Durable job store over Postgres. Row-level CAS via conditional UPDATEs.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the jobs table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}

fn storage(e: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(e.to_string())
}

fn row_to_job(row: &PgRow) -> Result<Job, JobStoreError> {
    let id: String = row.try_get("id").map_err(storage)?;
    let user_key: String = row.try_get("user_key").map_err(storage)?;
    let status: String = row.try_get("status").map_err(storage)?;
    let spec: serde_json::Value = row.try_get("spec").map_err(storage)?;
    let moderation_input: Option<serde_json::Value> =
        row.try_get("moderation_input").map_err(storage)?;
    let moderation_output: Option<serde_json::Value> =
        row.try_get("moderation_output").map_err(storage)?;
    let error_code: Option<String> = row.try_get("error_code").map_err(storage)?;
    let progress: i32 = row.try_get("progress").map_err(storage)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(storage)?;

    Ok(Job {
        id: JobId::from_str(&id).map_err(|e| JobStoreError::Storage(e.to_string()))?,
        user_key: UserKey::new(user_key).map_err(|e| JobStoreError::Storage(e.to_string()))?,
        idempotency_key: row.try_get("idempotency_key").map_err(storage)?,
        spec: serde_json::from_value(spec)
            .map_err(|e| JobStoreError::Storage(e.to_string()))?,
        status: match status.as_str() {
            "queued" => JobState::Queued,
            "running" => JobState::Running,
            "done" => JobState::Done,
            "failed" => JobState::Failed,
            other => return Err(JobStoreError::Storage(format!("unknown status {other}"))),
        },
        progress: progress.clamp(0, 100) as u8,
        current_step: row.try_get("current_step").map_err(storage)?,
        moderation_input: moderation_input
            .map(serde_json::from_value::<ModerationVerdict>)
            .transpose()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?,
        moderation_output: moderation_output
            .map(serde_json::from_value::<ModerationVerdict>)
            .transpose()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?,
        error_code: error_code.and_then(|c| ErrorCode::from_str(&c).ok()),
        error_message: row.try_get("error_message").map_err(storage)?,
        retry_count: retry_count.max(0) as u32,
        last_retry_at: row.try_get("last_retry_at").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
    })
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let spec = serde_json::to_value(&job.spec)
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO jobs (id, user_key, idempotency_key, spec, status, progress, \
             current_step, retry_count, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(job.id.as_str())
        .bind(job.user_key.as_str())
        .bind(&job.idempotency_key)
        .bind(spec)
        .bind(job.status.as_str())
        .bind(job.progress as i32)
        .bind(&job.current_step)
        .bind(job.retry_count as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(JobStoreError::DuplicateIdempotencyKey)
            }
            Err(e) => Err(storage(e)),
        }
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        user_key: &UserKey,
        key: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE user_key = $1 AND idempotency_key = $2")
            .bind(user_key.as_str())
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn update_progress(
        &self,
        id: &JobId,
        step: &str,
        progress: u8,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'running', current_step = $2, \
             progress = GREATEST(progress, $3), updated_at = $4 \
             WHERE id = $1 AND status IN ('queued', 'running')",
        )
        .bind(id.as_str())
        .bind(step)
        .bind(progress.min(100) as i32)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::Conflict("job is already terminal".to_string()));
        }
        Ok(())
    }

    async fn record_moderation(
        &self,
        id: &JobId,
        side: ModerationSide,
        verdict: ModerationVerdict,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let verdict = serde_json::to_value(&verdict)
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        let column = match side {
            ModerationSide::Input => "moderation_input",
            ModerationSide::Output => "moderation_output",
        };
        let result = sqlx::query(&format!(
            "UPDATE jobs SET {column} = $2, updated_at = $3 WHERE id = $1"
        ))
        .bind(id.as_str())
        .bind(verdict)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn complete(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'done', progress = 100, current_step = 'done', \
             updated_at = $2 WHERE id = $1 AND status = 'running'",
        )
        .bind(id.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail(
        &self,
        id: &JobId,
        code: ErrorCode,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', error_code = $2, error_message = $3, \
             updated_at = $4 WHERE id = $1 AND status IN ('queued', 'running')",
        )
        .bind(id.as_str())
        .bind(code.as_str())
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn requeue(
        &self,
        id: &JobId,
        observed_updated_at: DateTime<Utc>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'queued', retry_count = retry_count + 1, \
             last_retry_at = $3, updated_at = $3, \
             current_step = 'retrying (' || (retry_count + 1) || '/' || $4 || ')' \
             WHERE id = $1 AND updated_at = $2 AND status IN ('queued', 'running')",
        )
        .bind(id.as_str())
        .bind(observed_updated_at)
        .bind(now)
        .bind(max_retries as i32)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_stale(
        &self,
        state: JobState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE status = $1 AND updated_at < $2")
            .bind(state.as_str())
            .bind(updated_before)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn list_over_sla(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status IN ('queued', 'running') AND created_at < $1",
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn count_created_since(
        &self,
        user_key: &UserKey,
        since: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE user_key = $1 AND created_at >= $2",
        )
        .bind(user_key.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(count.max(0) as u64)
    }

    async fn count_pending(&self) -> Result<u64, JobStoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status IN ('queued', 'running')")
                .fetch_one(&self.pool)
                .await
                .map_err(storage)?;
        Ok(count.max(0) as u64)
    }

    async fn count_in_state_since(
        &self,
        state: JobState,
        updated_since: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE status = $1 AND updated_at > $2",
        )
        .bind(state.as_str())
        .bind(updated_since)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(count.max(0) as u64)
    }

    async fn count_in_state(&self, state: JobState) -> Result<u64, JobStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = $1")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(count.max(0) as u64)
    }
}
