//! LLM completion port and HTTP adapters.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;

/// One structured completion request. Prompts are opaque to the adapters.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl LlmRequest {
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            max_tokens: 4000,
            temperature: 0.7,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Provider-agnostic completion error kinds.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("llm call timed out")]
    Timeout,
    #[error("llm response is not valid json: {0}")]
    InvalidJson(String),
    #[error("llm provider error: {0}")]
    Provider(String),
}

/// Text completion against a configured model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete the request, returning the raw response text.
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError>;
}

/// Parse a completion into a typed value.
///
/// Models wrap JSON in markdown fences often enough that stripping them here
/// beats retrying the whole call.
pub fn parse_json_response<T: DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    let mut text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped;
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
    }
    if let Some(stripped) = text.strip_suffix("```") {
        text = stripped;
    }
    serde_json::from_str(text.trim()).map_err(|e| LlmError::InvalidJson(e.to_string()))
}

fn classify_reqwest(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Provider(e.to_string())
    }
}

/// OpenAI-style chat completions adapter.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client"),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": request.system_prompt},
                    {"role": "user", "content": request.user_prompt},
                ],
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
                "response_format": {"type": "json_object"},
            }))
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = %status, "openai completion failed");
            return Err(LlmError::Provider(format!("status {status}")));
        }

        let body: serde_json::Value = response.json().await.map_err(classify_reqwest)?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::Provider("response missing message content".to_string()))
    }
}

/// Anthropic messages adapter.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client"),
            base_url: "https://api.anthropic.com/v1".to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": self.model,
                "system": request.system_prompt,
                "messages": [
                    {"role": "user", "content": request.user_prompt},
                ],
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
            }))
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = %status, "anthropic completion failed");
            return Err(LlmError::Provider(format!("status {status}")));
        }

        let body: serde_json::Value = response.json().await.map_err(classify_reqwest)?;
        body["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::Provider("response missing text content".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        value: u32,
    }

    #[test]
    fn parses_plain_json() {
        let parsed: Payload = parse_json_response("{\"value\": 7}").unwrap();
        assert_eq!(parsed, Payload { value: 7 });
    }

    #[test]
    fn strips_markdown_fences() {
        let parsed: Payload =
            parse_json_response("```json\n{\"value\": 7}\n```").unwrap();
        assert_eq!(parsed, Payload { value: 7 });

        let parsed: Payload = parse_json_response("```\n{\"value\": 7}\n```").unwrap();
        assert_eq!(parsed, Payload { value: 7 });
    }

    #[test]
    fn invalid_json_is_classified() {
        let err = parse_json_response::<Payload>("not json at all").unwrap_err();
        assert!(matches!(err, LlmError::InvalidJson(_)));
    }
}
