//! The stage runner: one pipeline step with its own timeout, retry budget,
//! and error classification.

use std::future::Future;
use std::time::Duration;

use storyforge_core::{Clock, JobId};

use crate::error::{ErrorCode, PipelineError};
use crate::jobs::store::{JobStore, JobStoreError};

/// Per-stage execution policy.
#[derive(Debug, Clone, Copy)]
pub struct StagePolicy {
    /// Step label written to the job row.
    pub name: &'static str,
    /// Progress checkpoint reached when the stage starts.
    pub progress: u8,
    /// Per-attempt deadline. `None` for CPU-only stages.
    pub timeout: Option<Duration>,
    /// Retries after the first attempt.
    pub retries: u32,
    /// Code an elapsed deadline classifies to.
    pub timeout_code: ErrorCode,
}

impl StagePolicy {
    pub const fn cpu(name: &'static str, progress: u8) -> Self {
        Self {
            name,
            progress,
            timeout: None,
            retries: 0,
            timeout_code: ErrorCode::Unknown,
        }
    }
}

/// Run one stage: update the progress checkpoint, then attempt the body
/// under the policy's deadline, retrying retryable classifications with the
/// code's backoff schedule.
///
/// A `Conflict` from the progress write means the job is no longer live
/// (the monitor failed it); the stage aborts without running.
pub async fn run_stage<T, F, Fut>(
    store: &dyn JobStore,
    clock: &dyn Clock,
    job_id: &JobId,
    policy: &StagePolicy,
    mut attempt_fn: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    match store
        .update_progress(job_id, policy.name, policy.progress, clock.now())
        .await
    {
        Ok(()) => {}
        Err(JobStoreError::Conflict(msg)) => {
            return Err(PipelineError::new(
                ErrorCode::Unknown,
                format!("job no longer live: {msg}"),
            ));
        }
        Err(e) => return Err(PipelineError::db_write(e.to_string())),
    }

    // Stamp the enclosing job span (a no-op outside one) so every event
    // below reports the stage it belongs to.
    let span = tracing::Span::current();
    span.record("step", policy.name);

    let mut last_error: Option<PipelineError> = None;

    for attempt in 0..=policy.retries {
        span.record("attempt", attempt + 1);
        let result = match policy.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::new(policy.timeout_code, "stage deadline elapsed")),
            },
            None => attempt_fn().await,
        };

        match result {
            Ok(value) => {
                tracing::info!(
                    job_id = %job_id,
                    step = policy.name,
                    attempt = attempt + 1,
                    "step completed"
                );
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                tracing::warn!(
                    job_id = %job_id,
                    step = policy.name,
                    attempt = attempt + 1,
                    code = %e.code,
                    "step failed terminally"
                );
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job_id,
                    step = policy.name,
                    attempt = attempt + 1,
                    code = %e.code,
                    error = %e.message,
                    "step attempt failed"
                );
                if attempt < policy.retries {
                    let wait = e.code.backoff_secs(attempt);
                    tracing::info!(job_id = %job_id, step = policy.name, wait_secs = wait, "backing off before retry");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| PipelineError::new(ErrorCode::Unknown, "stage failed without error")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use chrono::Utc;
    use storyforge_core::{BookSpec, Language, ManualClock, Style, TargetAge, UserKey};

    use crate::jobs::{InMemoryJobStore, Job};

    fn spec() -> BookSpec {
        BookSpec {
            topic: "test topic".to_string(),
            language: Language::Ko,
            target_age: TargetAge::Age5To7,
            style: Style::Watercolor,
            page_count: 8,
            theme: None,
            character: None,
            character_id: None,
            character_ids: Vec::new(),
            forbidden_elements: Vec::new(),
        }
    }

    async fn seeded_store() -> (InMemoryJobStore, JobId) {
        let store = InMemoryJobStore::new();
        let job = Job::new(
            UserKey::new("stage-test-user").unwrap(),
            spec(),
            None,
            Utc::now(),
        );
        let id = job.id.clone();
        store.insert(job).await.unwrap();
        (store, id)
    }

    fn policy(retries: u32) -> StagePolicy {
        StagePolicy {
            name: "story",
            progress: 30,
            timeout: Some(Duration::from_secs(30)),
            retries,
            timeout_code: ErrorCode::LlmTimeout,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt_makes_one_call() {
        let (store, id) = seeded_store().await;
        let clock = ManualClock::from_system();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let result = run_stage(&store, &clock, &id, &policy(2), move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, PipelineError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.progress, 30);
        assert_eq!(job.current_step, "story");
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_exhaust_the_budget() {
        let (store, id) = seeded_store().await;
        let clock = ManualClock::from_system();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let result: Result<u32, _> = run_stage(&store, &clock, &id, &policy(2), move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::new(ErrorCode::LlmJsonInvalid, "bad json"))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::LlmJsonInvalid);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_stop_immediately() {
        let (store, id) = seeded_store().await;
        let clock = ManualClock::from_system();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let result: Result<u32, _> = run_stage(&store, &clock, &id, &policy(2), move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::safety_input("unsafe topic"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().code, ErrorCode::SafetyInput);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapse_classifies_to_the_stage_timeout_code() {
        let (store, id) = seeded_store().await;
        let clock = ManualClock::from_system();

        let result: Result<u32, _> = run_stage(&store, &clock, &id, &policy(0), || async {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(1)
        })
        .await;

        assert_eq!(result.unwrap_err().code, ErrorCode::LlmTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_follows_the_code_schedule() {
        let (store, id) = seeded_store().await;
        let clock = ManualClock::from_system();

        let started = tokio::time::Instant::now();
        let result: Result<u32, _> = run_stage(&store, &clock, &id, &policy(2), || async {
            Err(PipelineError::new(ErrorCode::LlmTimeout, "slow"))
        })
        .await;
        assert!(result.is_err());

        // Two sleeps between three attempts: 2s then 5s.
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn aborts_when_the_job_is_no_longer_live() {
        let (store, id) = seeded_store().await;
        let clock = ManualClock::from_system();
        store
            .fail(&id, ErrorCode::SlaBreach, "monitor", Utc::now())
            .await
            .unwrap();

        let result: Result<u32, _> =
            run_stage(&store, &clock, &id, &policy(2), || async { Ok(1) }).await;

        assert!(result.unwrap_err().message.contains("no longer live"));
    }
}
