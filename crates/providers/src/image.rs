//! Image generation port and HTTP adapters.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use storyforge_story::ImagePrompt;

/// Provider-agnostic image error kinds. All three are retryable at the
/// stage level, rate limiting with a longer backoff.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ImageError {
    #[error("image generation timed out")]
    Timeout,
    #[error("image provider rate limited the request")]
    RateLimited,
    #[error("image provider error: {0}")]
    Provider(String),
}

/// Image generation against a configured provider.
#[async_trait]
pub trait ImageClient: Send + Sync {
    /// Render one prompt to image bytes.
    async fn generate(&self, prompt: &ImagePrompt) -> Result<Bytes, ImageError>;
}

fn classify_reqwest(e: reqwest::Error) -> ImageError {
    if e.is_timeout() {
        ImageError::Timeout
    } else {
        ImageError::Provider(e.to_string())
    }
}

fn classify_status(status: reqwest::StatusCode, context: &str) -> ImageError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ImageError::RateLimited
    } else {
        ImageError::Provider(format!("{context}: status {status}"))
    }
}

/// Replicate-style adapter: create a prediction, poll it, download the
/// output.
pub struct ReplicateClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model_version: String,
    poll_interval: std::time::Duration,
    max_polls: u32,
}

impl ReplicateClient {
    pub fn new(api_key: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client"),
            base_url: "https://api.replicate.com/v1".to_string(),
            api_key: api_key.into(),
            model_version: "39ed52f2a78e934b3ba6e2a89f5b1c712de7dfea535525255b1aa35c5565e08b"
                .to_string(),
            poll_interval: std::time::Duration::from_secs(1),
            max_polls: 60,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = version.into();
        self
    }
}

#[async_trait]
impl ImageClient for ReplicateClient {
    async fn generate(&self, prompt: &ImagePrompt) -> Result<Bytes, ImageError> {
        let (width, height) = prompt.aspect_ratio.dimensions();
        let response = self
            .http
            .post(format!("{}/predictions", self.base_url))
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&json!({
                "version": self.model_version,
                "input": {
                    "prompt": prompt.positive_prompt,
                    "negative_prompt": prompt.negative_prompt,
                    "seed": prompt.seed,
                    "width": width,
                    "height": height,
                    "num_outputs": 1,
                },
            }))
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "create prediction"));
        }

        let prediction: serde_json::Value = response.json().await.map_err(classify_reqwest)?;
        let prediction_id = prediction["id"]
            .as_str()
            .ok_or_else(|| ImageError::Provider("prediction missing id".to_string()))?
            .to_string();

        for _ in 0..self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            let poll = self
                .http
                .get(format!("{}/predictions/{prediction_id}", self.base_url))
                .header("Authorization", format!("Token {}", self.api_key))
                .send()
                .await
                .map_err(classify_reqwest)?;

            if poll.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(ImageError::RateLimited);
            }
            if !poll.status().is_success() {
                continue;
            }

            let result: serde_json::Value = poll.json().await.map_err(classify_reqwest)?;
            match result["status"].as_str() {
                Some("succeeded") => {
                    let url = result["output"][0]
                        .as_str()
                        .ok_or_else(|| ImageError::Provider("prediction has no output".to_string()))?;
                    return self.download(url).await;
                }
                Some("failed") => {
                    let error = result["error"].as_str().unwrap_or("unknown error");
                    return Err(ImageError::Provider(format!("prediction failed: {error}")));
                }
                _ => {}
            }
        }

        Err(ImageError::Timeout)
    }
}

impl ReplicateClient {
    async fn download(&self, url: &str) -> Result<Bytes, ImageError> {
        let response = self.http.get(url).send().await.map_err(classify_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "download output"));
        }
        response.bytes().await.map_err(classify_reqwest)
    }
}

/// FAL-style adapter: one synchronous call returning output urls.
pub struct FalClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl FalClient {
    pub fn new(api_key: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client"),
            base_url: "https://fal.run/fal-ai/flux/schnell".to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl ImageClient for FalClient {
    async fn generate(&self, prompt: &ImagePrompt) -> Result<Bytes, ImageError> {
        let (width, height) = prompt.aspect_ratio.dimensions();
        let response = self
            .http
            .post(&self.base_url)
            .header("Authorization", format!("Key {}", self.api_key))
            .json(&json!({
                "prompt": prompt.positive_prompt,
                "image_size": {"width": width, "height": height},
                "seed": prompt.seed,
                "num_images": 1,
                "enable_safety_checker": true,
            }))
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "generate"));
        }

        let result: serde_json::Value = response.json().await.map_err(classify_reqwest)?;
        let url = result["images"][0]["url"]
            .as_str()
            .ok_or_else(|| ImageError::Provider("response has no images".to_string()))?;

        let image = self.http.get(url).send().await.map_err(classify_reqwest)?;
        let status = image.status();
        if !status.is_success() {
            return Err(classify_status(status, "download image"));
        }
        image.bytes().await.map_err(classify_reqwest)
    }
}
