//! Engine configuration with environment overrides.

use std::time::Duration;

/// Tunables for the pipeline, guardrails, and monitor.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-call timeout for LLM stages.
    pub llm_timeout: Duration,
    /// Per-image timeout for the image stage.
    pub image_timeout: Duration,
    /// Max in-flight image calls per job.
    pub image_max_concurrent: usize,
    /// Max in-flight image calls across the process.
    pub image_global_concurrent: usize,
    /// Attempts per image (including the first).
    pub image_max_attempts: u32,
    /// Monitor requeue budget for stuck jobs.
    pub job_max_retries: u32,
    /// Total wall-clock budget per job.
    pub sla: Duration,
    /// Running job with no progress for this long is stuck.
    pub stuck_timeout: Duration,
    /// Queued job untouched for this long is stuck.
    pub queued_stuck_timeout: Duration,
    /// Monitor sweep period.
    pub monitor_interval: Duration,
    /// Jobs a single user may create per UTC day.
    pub daily_job_limit_per_user: u64,
    /// Queued+running jobs across the system before refusing intake.
    pub max_pending_jobs: u64,
    /// Rate-limit window.
    pub rate_limit_window: Duration,
    /// Requests allowed per user per window.
    pub rate_limit_requests: u32,
    /// Credits granted on first sight of a user (0 disables).
    pub signup_bonus_credits: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm_timeout: Duration::from_secs(30),
            image_timeout: Duration::from_secs(90),
            image_max_concurrent: 3,
            image_global_concurrent: 3,
            image_max_attempts: 3,
            job_max_retries: 3,
            sla: Duration::from_secs(600),
            stuck_timeout: Duration::from_secs(15 * 60),
            queued_stuck_timeout: Duration::from_secs(30 * 60),
            monitor_interval: Duration::from_secs(5 * 60),
            daily_job_limit_per_user: 20,
            max_pending_jobs: 100,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_requests: 10,
            signup_bonus_credits: 10,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `STORYFORGE_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_u64("STORYFORGE_LLM_TIMEOUT_SECS") {
            cfg.llm_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("STORYFORGE_IMAGE_TIMEOUT_SECS") {
            cfg.image_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("STORYFORGE_IMAGE_MAX_CONCURRENT") {
            cfg.image_max_concurrent = v as usize;
            cfg.image_global_concurrent = cfg.image_global_concurrent.max(v as usize);
        }
        if let Some(v) = env_u64("STORYFORGE_JOB_SLA_SECS") {
            cfg.sla = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("STORYFORGE_STUCK_TIMEOUT_SECS") {
            cfg.stuck_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("STORYFORGE_MONITOR_INTERVAL_SECS") {
            cfg.monitor_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("STORYFORGE_DAILY_JOB_LIMIT") {
            cfg.daily_job_limit_per_user = v;
        }
        if let Some(v) = env_u64("STORYFORGE_MAX_PENDING_JOBS") {
            cfg.max_pending_jobs = v;
        }
        if let Some(v) = env_u64("STORYFORGE_RATE_LIMIT_REQUESTS") {
            cfg.rate_limit_requests = v as u32;
        }
        if let Some(v) = env_u64("STORYFORGE_RATE_LIMIT_WINDOW_SECS") {
            cfg.rate_limit_window = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("STORYFORGE_SIGNUP_BONUS_CREDITS") {
            cfg.signup_bonus_credits = v as i64;
        }
        cfg
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
