//! Stable error codes and the pipeline error type.
//!
//! Stage runners classify provider errors into these codes; the orchestrator
//! persists the terminal code on the job row. The request tier maps codes to
//! user-facing strings; provider-specific text never crosses this boundary.

use serde::{Deserialize, Serialize};

use storyforge_providers::moderation::ModerationError;
use storyforge_providers::{ImageError, LlmError, StorageError};

/// Stable, job-visible error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SafetyInput,
    SafetyOutput,
    LlmTimeout,
    LlmJsonInvalid,
    ImageTimeout,
    ImageRateLimit,
    ImageFailed,
    StorageUploadFailed,
    DbWriteFailed,
    QueueFailed,
    StuckTimeout,
    SlaBreach,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SafetyInput => "SAFETY_INPUT",
            ErrorCode::SafetyOutput => "SAFETY_OUTPUT",
            ErrorCode::LlmTimeout => "LLM_TIMEOUT",
            ErrorCode::LlmJsonInvalid => "LLM_JSON_INVALID",
            ErrorCode::ImageTimeout => "IMAGE_TIMEOUT",
            ErrorCode::ImageRateLimit => "IMAGE_RATE_LIMIT",
            ErrorCode::ImageFailed => "IMAGE_FAILED",
            ErrorCode::StorageUploadFailed => "STORAGE_UPLOAD_FAILED",
            ErrorCode::DbWriteFailed => "DB_WRITE_FAILED",
            ErrorCode::QueueFailed => "QUEUE_FAILED",
            ErrorCode::StuckTimeout => "STUCK_TIMEOUT",
            ErrorCode::SlaBreach => "SLA_BREACH",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// Whether a stage may retry this code within its own budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::LlmTimeout
                | ErrorCode::LlmJsonInvalid
                | ErrorCode::ImageTimeout
                | ErrorCode::ImageRateLimit
                | ErrorCode::ImageFailed
                | ErrorCode::StorageUploadFailed
                | ErrorCode::SafetyOutput
        )
    }

    /// Backoff schedule in seconds, indexed by attempt (clamped to the last
    /// entry).
    pub fn backoff_schedule(&self) -> &'static [u64] {
        match self {
            // Stage C's retryable outcomes share one schedule.
            ErrorCode::LlmTimeout | ErrorCode::LlmJsonInvalid | ErrorCode::SafetyOutput => {
                &[2, 5]
            }
            ErrorCode::ImageTimeout | ErrorCode::ImageFailed => &[2, 5, 12],
            ErrorCode::ImageRateLimit => &[5, 10, 20],
            ErrorCode::StorageUploadFailed => &[2, 5],
            _ => &[2],
        }
    }

    pub fn backoff_secs(&self, attempt: u32) -> u64 {
        let schedule = self.backoff_schedule();
        schedule[(attempt as usize).min(schedule.len() - 1)]
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "SAFETY_INPUT" => ErrorCode::SafetyInput,
            "SAFETY_OUTPUT" => ErrorCode::SafetyOutput,
            "LLM_TIMEOUT" => ErrorCode::LlmTimeout,
            "LLM_JSON_INVALID" => ErrorCode::LlmJsonInvalid,
            "IMAGE_TIMEOUT" => ErrorCode::ImageTimeout,
            "IMAGE_RATE_LIMIT" => ErrorCode::ImageRateLimit,
            "IMAGE_FAILED" => ErrorCode::ImageFailed,
            "STORAGE_UPLOAD_FAILED" => ErrorCode::StorageUploadFailed,
            "DB_WRITE_FAILED" => ErrorCode::DbWriteFailed,
            "QUEUE_FAILED" => ErrorCode::QueueFailed,
            "STUCK_TIMEOUT" => ErrorCode::StuckTimeout,
            "SLA_BREACH" => ErrorCode::SlaBreach,
            _ => ErrorCode::Unknown,
        })
    }
}

/// A classified pipeline failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct PipelineError {
    pub code: ErrorCode,
    pub message: String,
}

impl PipelineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn safety_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SafetyInput, message)
    }

    pub fn safety_output(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SafetyOutput, message)
    }

    pub fn sla_breach(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SlaBreach, message)
    }

    pub fn db_write(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DbWriteFailed, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl From<LlmError> for PipelineError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Timeout => Self::new(ErrorCode::LlmTimeout, "llm call timed out"),
            LlmError::InvalidJson(msg) => Self::new(ErrorCode::LlmJsonInvalid, msg),
            LlmError::Provider(msg) => Self::new(ErrorCode::LlmTimeout, msg),
        }
    }
}

impl From<ImageError> for PipelineError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::Timeout => Self::new(ErrorCode::ImageTimeout, "image call timed out"),
            ImageError::RateLimited => {
                Self::new(ErrorCode::ImageRateLimit, "image provider rate limited")
            }
            ImageError::Provider(msg) => Self::new(ErrorCode::ImageFailed, msg),
        }
    }
}

impl From<ModerationError> for PipelineError {
    fn from(e: ModerationError) -> Self {
        match e {
            ModerationError::Timeout => Self::new(ErrorCode::LlmTimeout, "moderation timed out"),
            ModerationError::Provider(msg) => Self::new(ErrorCode::LlmTimeout, msg),
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(e: StorageError) -> Self {
        Self::new(ErrorCode::StorageUploadFailed, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn codes_round_trip_through_strings() {
        for code in [
            ErrorCode::SafetyInput,
            ErrorCode::SafetyOutput,
            ErrorCode::LlmTimeout,
            ErrorCode::LlmJsonInvalid,
            ErrorCode::ImageTimeout,
            ErrorCode::ImageRateLimit,
            ErrorCode::ImageFailed,
            ErrorCode::StorageUploadFailed,
            ErrorCode::DbWriteFailed,
            ErrorCode::QueueFailed,
            ErrorCode::StuckTimeout,
            ErrorCode::SlaBreach,
            ErrorCode::Unknown,
        ] {
            assert_eq!(ErrorCode::from_str(code.as_str()), Ok(code));
        }
    }

    #[test]
    fn serde_names_match_the_wire_codes() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::LlmJsonInvalid).unwrap(),
            "\"LLM_JSON_INVALID\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::SlaBreach).unwrap(),
            "\"SLA_BREACH\""
        );
    }

    #[test]
    fn rate_limit_backoff_is_longer() {
        assert_eq!(ErrorCode::ImageFailed.backoff_schedule(), &[2, 5, 12]);
        assert_eq!(ErrorCode::ImageRateLimit.backoff_schedule(), &[5, 10, 20]);
        // Past the schedule end, the last entry repeats.
        assert_eq!(ErrorCode::ImageRateLimit.backoff_secs(9), 20);
    }

    #[test]
    fn safety_output_follows_the_story_stage_schedule() {
        assert_eq!(ErrorCode::SafetyOutput.backoff_schedule(), &[2, 5]);
        assert_eq!(
            ErrorCode::SafetyOutput.backoff_schedule(),
            ErrorCode::LlmJsonInvalid.backoff_schedule()
        );
    }

    #[test]
    fn safety_input_is_terminal() {
        assert!(!ErrorCode::SafetyInput.is_retryable());
        assert!(!ErrorCode::DbWriteFailed.is_retryable());
        assert!(ErrorCode::SafetyOutput.is_retryable());
    }
}
