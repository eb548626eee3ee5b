//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storyforge_core::{BookSpec, JobId, UserKey};
use storyforge_providers::ModerationVerdict;

use crate::error::ErrorCode;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Admitted, waiting to be picked up (or requeued by the monitor).
    Queued,
    /// A pipeline task is driving it.
    Running,
    /// Finished; a book with this `job_id` exists.
    Done,
    /// Terminally failed; `error_code`/`error_message` are set.
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    /// Queued or running: counts against the pending-jobs guardrail.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }
}

/// One generation job: the unit of work produced by a single admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_key: UserKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Frozen at admission; stages read, never write.
    pub spec: BookSpec,
    pub status: JobState,
    pub progress: u8,
    pub current_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderation_input: Option<ModerationVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderation_output: Option<ModerationVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        user_key: UserKey,
        spec: BookSpec,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            user_key,
            idempotency_key,
            spec,
            status: JobState::Queued,
            progress: 0,
            current_step: "queued".to_string(),
            moderation_input: None,
            moderation_output: None,
            error_code: None,
            error_message: None,
            retry_count: 0,
            last_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the wall clock has exceeded the job's SLA.
    pub fn is_over_sla(&self, now: DateTime<Utc>, sla: std::time::Duration) -> bool {
        let age = now - self.created_at;
        age.to_std().map(|age| age > sla).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_core::{Language, Style, TargetAge};

    pub(crate) fn spec() -> BookSpec {
        BookSpec {
            topic: "토끼가 하늘을 나는 이야기".to_string(),
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

    #[test]
    fn new_jobs_start_queued_at_zero_progress() {
        let job = Job::new(
            UserKey::new("user-00000001").unwrap(),
            spec(),
            None,
            Utc::now(),
        );
        assert_eq!(job.status, JobState::Queued);
        assert_eq!(job.progress, 0);
        assert!(job.status.is_pending());
        assert!(!job.status.is_terminal());
    }

    #[test]
    fn sla_compares_against_created_at() {
        let now = Utc::now();
        let job = Job::new(UserKey::new("user-00000001").unwrap(), spec(), None, now);
        let sla = std::time::Duration::from_secs(600);
        assert!(!job.is_over_sla(now + chrono::Duration::seconds(600), sla));
        assert!(job.is_over_sla(now + chrono::Duration::seconds(601), sla));
    }
}
