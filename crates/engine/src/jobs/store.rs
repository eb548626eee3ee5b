//! Job storage: trait + in-memory implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use storyforge_core::{JobId, UserKey};
use storyforge_providers::ModerationVerdict;

use super::types::{Job, JobState};
use crate::error::ErrorCode;

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists for idempotency key")]
    DuplicateIdempotencyKey,
    #[error("stale transition: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Which moderation verdict to record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationSide {
    Input,
    Output,
}

/// Durable mapping `job_id → Job`.
///
/// Writes serialize on the row. Transitions return `Ok(false)` when the
/// compare-and-set found the row in a different state than expected; callers
/// treat that as "someone else got there first", never as an error.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job, enforcing `(user_key, idempotency_key)` uniqueness.
    async fn insert(&self, job: Job) -> Result<(), JobStoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError>;

    async fn find_by_idempotency_key(
        &self,
        user_key: &UserKey,
        key: &str,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Mark the job running and advance progress/step. Stored progress is
    /// `greatest(stored, proposed)` so racing image completions stay
    /// monotone. Fails with `Conflict` when the job is already terminal —
    /// that is the abort signal for a worker whose job the monitor killed.
    async fn update_progress(
        &self,
        id: &JobId,
        step: &str,
        progress: u8,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    async fn record_moderation(
        &self,
        id: &JobId,
        side: ModerationSide,
        verdict: ModerationVerdict,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// CAS `running → done` at progress 100. Returns whether it applied.
    async fn complete(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// CAS `{queued,running} → failed` with the terminal code. Returns
    /// whether it applied (false when the job already reached a terminal
    /// state).
    async fn fail(
        &self,
        id: &JobId,
        code: ErrorCode,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Monitor requeue: CAS against the observed `updated_at`; bumps
    /// `retry_count`, stamps `last_retry_at`. Returns whether it applied.
    async fn requeue(
        &self,
        id: &JobId,
        observed_updated_at: DateTime<Utc>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Jobs in `state` whose `updated_at` is older than the threshold.
    async fn list_stale(
        &self,
        state: JobState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Live (queued/running) jobs created before the threshold.
    async fn list_over_sla(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs this user created since the threshold (daily-cap guardrail).
    async fn count_created_since(
        &self,
        user_key: &UserKey,
        since: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;

    /// Queued+running jobs across the system (overload guardrail).
    async fn count_pending(&self) -> Result<u64, JobStoreError>;

    /// Jobs in `state` touched since the threshold (health metrics).
    async fn count_in_state_since(
        &self,
        state: JobState,
        updated_since: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;

    /// All jobs in `state` (health metrics).
    async fn count_in_state(&self, state: JobState) -> Result<u64, JobStoreError>;
}

/// In-memory job store for dev/test.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if let Some(key) = &job.idempotency_key {
            let duplicate = jobs
                .values()
                .any(|j| j.user_key == job.user_key && j.idempotency_key.as_deref() == Some(key));
            if duplicate {
                return Err(JobStoreError::DuplicateIdempotencyKey);
            }
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().unwrap().get(id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        user_key: &UserKey,
        key: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .values()
            .find(|j| &j.user_key == user_key && j.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn update_progress(
        &self,
        id: &JobId,
        step: &str,
        progress: u8,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
        if job.status.is_terminal() {
            return Err(JobStoreError::Conflict(format!(
                "job is already {}",
                job.status.as_str()
            )));
        }
        job.status = JobState::Running;
        job.current_step = step.to_string();
        job.progress = job.progress.max(progress.min(100));
        job.updated_at = now;
        Ok(())
    }

    async fn record_moderation(
        &self,
        id: &JobId,
        side: ModerationSide,
        verdict: ModerationVerdict,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
        match side {
            ModerationSide::Input => job.moderation_input = Some(verdict),
            ModerationSide::Output => job.moderation_output = Some(verdict),
        }
        job.updated_at = now;
        Ok(())
    }

    async fn complete(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
        if job.status != JobState::Running {
            return Ok(false);
        }
        job.status = JobState::Done;
        job.progress = 100;
        job.current_step = "done".to_string();
        job.updated_at = now;
        Ok(true)
    }

    async fn fail(
        &self,
        id: &JobId,
        code: ErrorCode,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = JobState::Failed;
        job.error_code = Some(code);
        job.error_message = Some(message.to_string());
        job.updated_at = now;
        Ok(true)
    }

    async fn requeue(
        &self,
        id: &JobId,
        observed_updated_at: DateTime<Utc>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
        if job.status.is_terminal() || job.updated_at != observed_updated_at {
            return Ok(false);
        }
        job.status = JobState::Queued;
        job.retry_count += 1;
        job.last_retry_at = Some(now);
        job.current_step = format!("retrying ({}/{})", job.retry_count, max_retries);
        job.updated_at = now;
        Ok(true)
    }

    async fn list_stale(
        &self,
        state: JobState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.status == state && j.updated_at < updated_before)
            .cloned()
            .collect())
    }

    async fn list_over_sla(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.status.is_pending() && j.created_at < created_before)
            .cloned()
            .collect())
    }

    async fn count_created_since(
        &self,
        user_key: &UserKey,
        since: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| &j.user_key == user_key && j.created_at >= since)
            .count() as u64)
    }

    async fn count_pending(&self) -> Result<u64, JobStoreError> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.status.is_pending())
            .count() as u64)
    }

    async fn count_in_state_since(
        &self,
        state: JobState,
        updated_since: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.status == state && j.updated_at > updated_since)
            .count() as u64)
    }

    async fn count_in_state(&self, state: JobState) -> Result<u64, JobStoreError> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.status == state)
            .count() as u64)
    }
}
