//! Content moderation port.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use storyforge_core::policy;

use crate::llm::{parse_json_response, LlmClient, LlmError, LlmRequest};

/// Safety verdict for a piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub is_safe: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ModerationVerdict {
    pub fn safe() -> Self {
        Self {
            is_safe: true,
            reasons: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn unsafe_because(reason: impl Into<String>) -> Self {
        Self {
            is_safe: false,
            reasons: vec![reason.into()],
            suggestions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ModerationError {
    #[error("moderation call timed out")]
    Timeout,
    #[error("moderation provider error: {0}")]
    Provider(String),
}

impl From<LlmError> for ModerationError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Timeout => ModerationError::Timeout,
            LlmError::InvalidJson(msg) | LlmError::Provider(msg) => {
                ModerationError::Provider(msg)
            }
        }
    }
}

/// Safety classification of text. Pure from the orchestrator's perspective.
#[async_trait]
pub trait ContentModeration: Send + Sync {
    async fn classify_text(&self, text: &str) -> Result<ModerationVerdict, ModerationError>;
}

/// Lexicon-backed moderation: flags the banned safety lexicon. Used as the
/// output-side check and as the dev/test default for the input side.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexiconModeration;

#[async_trait]
impl ContentModeration for LexiconModeration {
    async fn classify_text(&self, text: &str) -> Result<ModerationVerdict, ModerationError> {
        match policy::find_banned(text) {
            Some(token) => Ok(ModerationVerdict::unsafe_because(format!(
                "contains banned token: {token}"
            ))),
            None => Ok(ModerationVerdict::safe()),
        }
    }
}

/// LLM-backed moderation for the input side, where intent matters more than
/// token matching.
pub struct LlmModeration {
    llm: Arc<dyn LlmClient>,
}

impl LlmModeration {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ContentModeration for LlmModeration {
    async fn classify_text(&self, text: &str) -> Result<ModerationVerdict, ModerationError> {
        let request = LlmRequest::new(
            "You are a content safety classifier for children's picture books. \
             Respond with JSON only: {\"is_safe\": bool, \"reasons\": [..], \"suggestions\": [..]}. \
             Flag violence, adult content, substances, weapons, and frightening themes.",
            format!("Classify this book request:\n{text}"),
        )
        .with_max_tokens(500)
        .with_temperature(0.3);

        let response = self.llm.complete(&request).await?;
        let verdict = parse_json_response::<ModerationVerdict>(&response)?;
        Ok(verdict)
    }
}
