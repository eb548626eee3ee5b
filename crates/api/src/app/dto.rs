//! Request/response DTOs and JSON mapping helpers.

use serde::{Deserialize, Serialize};

use storyforge_core::JobId;
use storyforge_engine::{ErrorCode, Job, JobState, RegenerateTarget};
use storyforge_story::Book;

#[derive(Debug, Serialize)]
pub struct CreateBookResponse {
    pub job_id: JobId,
    pub status: JobState,
    pub estimated_time_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: JobState,
    pub progress: u8,
    pub current_step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Book>,
}

impl JobStatusResponse {
    pub fn from_job(job: Job, book: Option<Book>) -> Self {
        let error = match (&job.status, job.error_code) {
            (JobState::Failed, Some(code)) => Some(ErrorInfo {
                code,
                message: job.error_message.clone().unwrap_or_default(),
            }),
            _ => None,
        };
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            current_step: job.current_step,
            error,
            result: book,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegeneratePageRequest {
    pub target: RegenerateTarget,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegeneratePageResponse {
    pub job_id: JobId,
    pub page_number: u32,
    pub target: RegenerateTarget,
}

#[derive(Debug, Deserialize)]
pub struct CreateCharacterRequest {
    pub name: String,
    pub master_description: String,
    pub appearance: storyforge_story::CharacterAppearance,
    pub clothing: storyforge_story::CharacterClothing,
    pub personality_traits: Vec<String>,
    #[serde(default)]
    pub visual_style_notes: String,
}

#[derive(Debug, Serialize)]
pub struct CreditsResponse {
    pub balance: i64,
}
