//! The job monitor: a single cooperative sweeper that recovers stuck jobs
//! and enforces the job SLA.
//!
//! Safe to run concurrently with the orchestrator: every transition is
//! compare-and-set against the state the sweep observed, so a stage that
//! just made progress is never clobbered.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde::Serialize;

use storyforge_core::Clock;
use storyforge_credits::CreditLedger;

use crate::config::EngineConfig;
use crate::dispatch::JobDispatcher;
use crate::error::ErrorCode;
use crate::jobs::store::{JobStore, JobStoreError};
use crate::jobs::types::{Job, JobState};
use crate::orchestrator::REFUND_REASON;

/// Health metrics computed from the job store.
#[derive(Debug, Clone, Serialize)]
pub struct JobMetrics {
    pub queued: u64,
    pub running: u64,
    pub stuck: u64,
    pub completed_last_hour: u64,
    pub failed_last_hour: u64,
    pub success_rate: f64,
}

/// Summary of one sweep, for logs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub requeued: u64,
    pub failed_stuck: u64,
    pub failed_sla: u64,
}

pub struct JobMonitor {
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn CreditLedger>,
    dispatcher: Arc<dyn JobDispatcher>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl JobMonitor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        ledger: Arc<dyn CreditLedger>,
        dispatcher: Arc<dyn JobDispatcher>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            ledger,
            dispatcher,
            config,
            clock,
        }
    }

    /// Run the sweep loop until the returned handle is aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.monitor_interval;
        tracing::info!(interval_secs = interval.as_secs(), "job monitor started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh process
            // doesn't sweep before the stores are warm.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    tracing::error!(error = %e, "job monitor sweep failed");
                }
            }
        })
    }

    /// One pass: requeue or fail stuck jobs, then fail SLA breaches.
    pub async fn sweep(&self) -> Result<SweepOutcome, JobStoreError> {
        let now = self.clock.now();
        let mut outcome = SweepOutcome::default();

        let stuck_running_cutoff = now
            - ChronoDuration::from_std(self.config.stuck_timeout)
                .unwrap_or_else(|_| ChronoDuration::minutes(15));
        let stuck_queued_cutoff = now
            - ChronoDuration::from_std(self.config.queued_stuck_timeout)
                .unwrap_or_else(|_| ChronoDuration::minutes(30));
        let sla_cutoff = now
            - ChronoDuration::from_std(self.config.sla)
                .unwrap_or_else(|_| ChronoDuration::seconds(600));

        let stuck_running = self
            .jobs
            .list_stale(JobState::Running, stuck_running_cutoff)
            .await?;
        let stuck_queued = self
            .jobs
            .list_stale(JobState::Queued, stuck_queued_cutoff)
            .await?;

        let mut handled = std::collections::HashSet::new();
        for job in stuck_running.iter().chain(stuck_queued.iter()) {
            handled.insert(job.id.clone());
            self.handle_stuck(job, &mut outcome).await?;
        }

        for job in self.jobs.list_over_sla(sla_cutoff).await? {
            // Jobs the stuck pass just requeued keep their retry chance;
            // they fail with STUCK_TIMEOUT once the budget runs out.
            if handled.contains(&job.id) {
                continue;
            }
            if self.fail_with_refund(&job, ErrorCode::SlaBreach, "job exceeded SLA").await? {
                outcome.failed_sla += 1;
            }
        }

        if outcome != SweepOutcome::default() {
            tracing::info!(
                requeued = outcome.requeued,
                failed_stuck = outcome.failed_stuck,
                failed_sla = outcome.failed_sla,
                "job monitor sweep complete"
            );
        }
        Ok(outcome)
    }

    async fn handle_stuck(
        &self,
        job: &Job,
        outcome: &mut SweepOutcome,
    ) -> Result<(), JobStoreError> {
        if job.retry_count < self.config.job_max_retries {
            let applied = self
                .jobs
                .requeue(
                    &job.id,
                    job.updated_at,
                    self.config.job_max_retries,
                    self.clock.now(),
                )
                .await?;
            if !applied {
                tracing::debug!(job_id = %job.id, "stuck job made progress since observation, leaving it");
                return Ok(());
            }
            outcome.requeued += 1;
            tracing::info!(
                job_id = %job.id,
                retry_count = job.retry_count + 1,
                "stuck job requeued"
            );
            if let Err(e) = self.dispatcher.dispatch(job.id.clone()).await {
                tracing::error!(job_id = %job.id, error = %e, "re-dispatch of requeued job failed");
            }
        } else if self
            .fail_with_refund(
                job,
                ErrorCode::StuckTimeout,
                &format!("max retries ({}) exceeded", self.config.job_max_retries),
            )
            .await?
        {
            outcome.failed_stuck += 1;
        }
        Ok(())
    }

    /// CAS-fail a job and refund its debit. Returns whether this sweep was
    /// the writer that failed it.
    async fn fail_with_refund(
        &self,
        job: &Job,
        code: ErrorCode,
        message: &str,
    ) -> Result<bool, JobStoreError> {
        let applied = self
            .jobs
            .fail(&job.id, code, message, self.clock.now())
            .await?;
        if !applied {
            return Ok(false);
        }
        tracing::warn!(job_id = %job.id, code = %code, message, "job failed by monitor");
        if let Err(e) = self
            .ledger
            .refund(&job.user_key, 1, REFUND_REASON, &job.id)
            .await
        {
            tracing::error!(job_id = %job.id, error = %e, "refund after monitor failure failed");
        }
        Ok(true)
    }

    /// Job metrics for the detailed health endpoint.
    pub async fn metrics(&self) -> Result<JobMetrics, JobStoreError> {
        let now = self.clock.now();
        let stuck_cutoff = now
            - ChronoDuration::from_std(self.config.stuck_timeout)
                .unwrap_or_else(|_| ChronoDuration::minutes(15));
        let hour_ago = now - ChronoDuration::hours(1);

        let queued = self.jobs.count_in_state(JobState::Queued).await?;
        let running = self.jobs.count_in_state(JobState::Running).await?;
        let stuck = self
            .jobs
            .list_stale(JobState::Running, stuck_cutoff)
            .await?
            .len() as u64;
        let completed_last_hour = self
            .jobs
            .count_in_state_since(JobState::Done, hour_ago)
            .await?;
        let failed_last_hour = self
            .jobs
            .count_in_state_since(JobState::Failed, hour_ago)
            .await?;

        let finished = completed_last_hour + failed_last_hour;
        let success_rate = if finished > 0 {
            completed_last_hour as f64 / finished as f64 * 100.0
        } else {
            100.0
        };

        Ok(JobMetrics {
            queued,
            running,
            stuck,
            completed_last_hour,
            failed_last_hour,
            success_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use storyforge_core::{
        BookSpec, Language, ManualClock, Style, TargetAge, UserKey,
    };
    use storyforge_credits::InMemoryCreditLedger;

    use crate::dispatch::RecordingDispatcher;
    use crate::jobs::InMemoryJobStore;

    fn spec() -> BookSpec {
        BookSpec {
            topic: "monitor test".to_string(),
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

    struct Fixture {
        monitor: JobMonitor,
        jobs: Arc<InMemoryJobStore>,
        ledger: Arc<InMemoryCreditLedger>,
        dispatcher: Arc<RecordingDispatcher>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::from_system());
        let jobs = Arc::new(InMemoryJobStore::new());
        let ledger = Arc::new(InMemoryCreditLedger::with_clock(clock.clone()));
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let monitor = JobMonitor::new(
            jobs.clone(),
            ledger.clone(),
            dispatcher.clone(),
            EngineConfig::default(),
            clock.clone(),
        );
        Fixture {
            monitor,
            jobs,
            ledger,
            dispatcher,
            clock,
        }
    }

    fn user() -> UserKey {
        UserKey::new("monitor-test-user").unwrap()
    }

    async fn seed_job(f: &Fixture) -> Job {
        let job = Job::new(user(), spec(), None, f.clock.now());
        f.jobs.insert(job.clone()).await.unwrap();
        // Account exists so refunds have somewhere to land.
        f.ledger
            .debit(&user(), 1, "book_generation", Some(&job.id))
            .await
            .unwrap();
        job
    }

    #[tokio::test]
    async fn stuck_running_job_is_requeued_and_redispatched() {
        let f = fixture();
        let job = seed_job(&f).await;
        f.jobs
            .update_progress(&job.id, "writing story", 30, f.clock.now())
            .await
            .unwrap();

        f.clock.advance(ChronoDuration::minutes(20));
        let outcome = f.monitor.sweep().await.unwrap();

        assert_eq!(outcome.requeued, 1);
        let stored = f.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobState::Queued);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.last_retry_at.is_some());
        assert_eq!(f.dispatcher.dispatched(), vec![job.id.clone()]);
    }

    #[tokio::test]
    async fn fresh_running_jobs_are_left_alone() {
        let f = fixture();
        let job = seed_job(&f).await;
        f.jobs
            .update_progress(&job.id, "writing story", 30, f.clock.now())
            .await
            .unwrap();

        f.clock.advance(ChronoDuration::minutes(5));
        let outcome = f.monitor.sweep().await.unwrap();

        assert_eq!(outcome, SweepOutcome::default());
        let stored = f.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobState::Running);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_stuck_timeout_and_refund() {
        let f = fixture();
        let job = seed_job(&f).await;
        let balance_before = f.ledger.balance(&user()).await.unwrap();

        // Three requeues, then the fourth sweep gives up.
        for _ in 0..4 {
            f.jobs
                .update_progress(&job.id, "writing story", 30, f.clock.now())
                .await
                .unwrap();
            f.clock.advance(ChronoDuration::minutes(20));
            f.monitor.sweep().await.unwrap();
        }

        let stored = f.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobState::Failed);
        assert_eq!(stored.error_code, Some(ErrorCode::StuckTimeout));
        assert_eq!(stored.retry_count, 3);
        // Refunded exactly once despite repeated sweeps.
        f.monitor.sweep().await.unwrap();
        assert_eq!(
            f.ledger.balance(&user()).await.unwrap(),
            balance_before + 1
        );
    }

    #[tokio::test]
    async fn sla_breach_fails_live_jobs_and_refunds() {
        let f = fixture();
        let job = seed_job(&f).await;
        let balance_before = f.ledger.balance(&user()).await.unwrap();

        f.clock.advance(ChronoDuration::seconds(601));
        let outcome = f.monitor.sweep().await.unwrap();

        assert_eq!(outcome.failed_sla, 1);
        let stored = f.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobState::Failed);
        assert_eq!(stored.error_code, Some(ErrorCode::SlaBreach));
        assert_eq!(
            f.ledger.balance(&user()).await.unwrap(),
            balance_before + 1
        );

        // A second sweep is a no-op: the CAS finds the job terminal.
        let outcome = f.monitor.sweep().await.unwrap();
        assert_eq!(outcome, SweepOutcome::default());
        assert_eq!(
            f.ledger.balance(&user()).await.unwrap(),
            balance_before + 1
        );
    }

    #[tokio::test]
    async fn requeue_skips_jobs_that_progressed_since_observation() {
        let f = fixture();
        let job = seed_job(&f).await;
        f.jobs
            .update_progress(&job.id, "writing story", 30, f.clock.now())
            .await
            .unwrap();

        // Observe a stale copy, then let the job make progress.
        f.clock.advance(ChronoDuration::minutes(20));
        let stale = f.jobs.get(&job.id).await.unwrap().unwrap();
        f.jobs
            .update_progress(&job.id, "images (3/9)", 70, f.clock.now())
            .await
            .unwrap();

        let applied = f
            .jobs
            .requeue(&stale.id, stale.updated_at, 3, f.clock.now())
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn metrics_report_counts_and_success_rate() {
        let f = fixture();
        let a = seed_job(&f).await;
        let b = seed_job(&f).await;
        let _queued = seed_job(&f).await;

        f.jobs
            .update_progress(&a.id, "packaging", 95, f.clock.now())
            .await
            .unwrap();
        f.jobs.complete(&a.id, f.clock.now()).await.unwrap();
        f.jobs
            .fail(&b.id, ErrorCode::ImageFailed, "boom", f.clock.now())
            .await
            .unwrap();

        let metrics = f.monitor.metrics().await.unwrap();
        assert_eq!(metrics.queued, 1);
        assert_eq!(metrics.running, 0);
        assert_eq!(metrics.completed_last_hour, 1);
        assert_eq!(metrics.failed_last_hour, 1);
        assert!((metrics.success_rate - 50.0).abs() < f64::EPSILON);
    }
}
