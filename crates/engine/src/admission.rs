//! Admission: idempotency, rate limit, guardrails, credit debit, persist,
//! dispatch — in that order.
//!
//! Admission failures never leave a debit behind: the debit happens last
//! before the insert, and an insert failure refunds it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use storyforge_core::{BookSpec, Clock, DomainError, JobId, UserKey};
use storyforge_credits::{CreditError, CreditLedger};

use crate::config::EngineConfig;
use crate::dispatch::JobDispatcher;
use crate::jobs::store::{JobStore, JobStoreError};
use crate::jobs::types::{Job, JobState};
use crate::orchestrator::REFUND_REASON;
use crate::rate_limit::{RateDecision, SlidingWindowLimiter};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid specification: {0}")]
    InvalidSpec(#[from] DomainError),
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("daily job limit reached ({used}/{limit})")]
    DailyLimit { limit: u64, used: u64 },
    #[error("system overloaded, try again later")]
    Overloaded,
    #[error("no credits left")]
    NoCredits,
    #[error("failed to enqueue job")]
    QueueFailed,
    #[error("admission storage error: {0}")]
    Storage(String),
}

/// Result of an admission request.
#[derive(Debug, Clone)]
pub struct AdmissionOutcome {
    pub job_id: JobId,
    pub status: JobState,
    /// True when an idempotency replay returned an existing job.
    pub reused: bool,
}

pub struct AdmissionController {
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn CreditLedger>,
    limiter: SlidingWindowLimiter,
    dispatcher: Arc<dyn JobDispatcher>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        ledger: Arc<dyn CreditLedger>,
        limiter: SlidingWindowLimiter,
        dispatcher: Arc<dyn JobDispatcher>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            ledger,
            limiter,
            dispatcher,
            config,
            clock,
        }
    }

    /// Admit one request. Side effects: at most one debit and one job row
    /// per `(user_key, idempotency_key)`.
    pub async fn create_job(
        &self,
        user_key: &UserKey,
        spec: BookSpec,
        idempotency_key: Option<String>,
    ) -> Result<AdmissionOutcome, AdmissionError> {
        spec.validate()?;

        // 1. Idempotency probe: a replay returns the existing job with no
        //    side effects at all (not even a rate-limit count).
        if let Some(key) = &idempotency_key {
            if let Some(existing) = self
                .jobs
                .find_by_idempotency_key(user_key, key)
                .await
                .map_err(|e| AdmissionError::Storage(e.to_string()))?
            {
                tracing::info!(job_id = %existing.id, idempotency_key = %key, "idempotent replay");
                return Ok(AdmissionOutcome {
                    job_id: existing.id,
                    status: existing.status,
                    reused: true,
                });
            }
        }

        // 2. Rate limit.
        if let RateDecision::Deny { retry_after } = self.limiter.check(user_key).await {
            return Err(AdmissionError::RateLimited { retry_after });
        }

        // 3. Guardrails.
        let today = start_of_today_utc(self.clock.now());
        let used = self
            .jobs
            .count_created_since(user_key, today)
            .await
            .map_err(|e| AdmissionError::Storage(e.to_string()))?;
        if used >= self.config.daily_job_limit_per_user {
            return Err(AdmissionError::DailyLimit {
                limit: self.config.daily_job_limit_per_user,
                used,
            });
        }

        let pending = self
            .jobs
            .count_pending()
            .await
            .map_err(|e| AdmissionError::Storage(e.to_string()))?;
        if pending >= self.config.max_pending_jobs {
            tracing::warn!(pending, limit = self.config.max_pending_jobs, "refusing intake, system overloaded");
            return Err(AdmissionError::Overloaded);
        }

        // 4. Credit debit, then 5. persist — refund if the insert fails so
        //    the two commit together from the caller's perspective.
        let job = Job::new(
            user_key.clone(),
            spec.normalized(),
            idempotency_key.clone(),
            self.clock.now(),
        );
        let job_id = job.id.clone();

        match self
            .ledger
            .debit(user_key, 1, "book_generation", Some(&job_id))
            .await
        {
            Ok(_) => {}
            Err(CreditError::InsufficientCredits { .. }) => {
                return Err(AdmissionError::NoCredits);
            }
            Err(e) => return Err(AdmissionError::Storage(e.to_string())),
        }

        if let Err(e) = self.jobs.insert(job).await {
            if let Err(refund_err) = self
                .ledger
                .refund(user_key, 1, REFUND_REASON, &job_id)
                .await
            {
                tracing::error!(job_id = %job_id, error = %refund_err, "refund after failed insert also failed");
            }
            return match e {
                // Concurrent replay of the same idempotency key: surface the
                // winner's job.
                JobStoreError::DuplicateIdempotencyKey => {
                    let key = idempotency_key.expect("duplicate implies a key");
                    let existing = self
                        .jobs
                        .find_by_idempotency_key(user_key, &key)
                        .await
                        .map_err(|e| AdmissionError::Storage(e.to_string()))?
                        .ok_or_else(|| AdmissionError::Storage("duplicate row vanished".to_string()))?;
                    Ok(AdmissionOutcome {
                        job_id: existing.id,
                        status: existing.status,
                        reused: true,
                    })
                }
                e => Err(AdmissionError::Storage(e.to_string())),
            };
        }

        // 6. Dispatch.
        if let Err(e) = self.dispatcher.dispatch(job_id.clone()).await {
            tracing::error!(job_id = %job_id, error = %e, "dispatch failed");
            let now = self.clock.now();
            let _ = self
                .jobs
                .fail(&job_id, crate::error::ErrorCode::QueueFailed, &e.to_string(), now)
                .await;
            let _ = self.ledger.refund(user_key, 1, REFUND_REASON, &job_id).await;
            return Err(AdmissionError::QueueFailed);
        }

        tracing::info!(job_id = %job_id, user_key = %user_key, "job admitted");
        Ok(AdmissionOutcome {
            job_id,
            status: JobState::Queued,
            reused: false,
        })
    }
}

fn start_of_today_utc(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_utc()
}
