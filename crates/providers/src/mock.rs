//! Mock providers for dev/test.
//!
//! The mock LLM recognizes the request kind from the system prompt and
//! returns a well-formed payload shaped by the `key: value` lines of the
//! user prompt, so the pipeline runs end-to-end without network access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use storyforge_story::ImagePrompt;

use crate::image::{ImageClient, ImageError};
use crate::llm::{LlmClient, LlmError, LlmRequest};

fn extract<'a>(prompt: &'a str, key: &str) -> Option<&'a str> {
    let marker = format!("{key}:");
    prompt.lines().find_map(|line| {
        line.trim()
            .strip_prefix(marker.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    })
}

fn extract_u32(prompt: &str, key: &str, default: u32) -> u32 {
    extract(prompt, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Mock LLM. Deterministic, instant (configurable latency), always safe.
pub struct MockLlmClient {
    latency: Duration,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn page_text(age: &str, page: u32) -> String {
        match age {
            "3-5" => format!("토끼가 뛰어요. 장면 {page}이에요."),
            "7-9" => format!(
                "토끼는 숲속 깊은 곳으로 걸어갔어요. 장면 {page}에서 새로운 친구를 만났어요. 함께 모험을 이어가기로 했어요."
            ),
            "adult" => format!(
                "The rabbit pressed deeper into the forest as dusk settled. Scene {page} unfolded slowly, the light thinning between the trees. Something about the silence felt like an invitation."
            ),
            _ => format!("토끼는 숲속을 걸었어요. 장면 {page}의 이야기예요."),
        }
    }

    fn story(&self, user_prompt: &str) -> serde_json::Value {
        let pages = extract_u32(user_prompt, "page_count", 8);
        let age = extract(user_prompt, "target_age").unwrap_or("5-7");
        let language = extract(user_prompt, "language").unwrap_or("ko");
        json!({
            "title": "용감한 토끼의 숲속 모험",
            "language": language,
            "target_age": age,
            "moral": "용기를 내면 무엇이든 할 수 있어요.",
            "characters": [
                {
                    "id": "rabbit_hero",
                    "name": "토끼",
                    "role": "main",
                    "brief": "숲속에 사는 용감하고 호기심 많은 하얀 토끼입니다."
                }
            ],
            "cover": {
                "cover_text": "용감한 토끼의 숲속 모험",
                "scene": "햇살이 비치는 숲속 입구에서 토끼가 모험을 시작합니다.",
                "mood": "희망찬",
                "camera": "wide shot from slightly above"
            },
            "pages": (1..=pages).map(|i| json!({
                "page": i,
                "text": Self::page_text(age, i),
                "scene": format!("숲속 장면 {i}: 토끼가 나무들 사이를 걸어갑니다."),
                "mood": "평화로운",
                "camera": "medium shot",
                "characters_present": ["rabbit_hero"]
            })).collect::<Vec<_>>(),
            "continuity": {
                "character_consistency_notes": "토끼는 항상 파란 조끼를 입고 있으며 분홍색 코가 특징입니다.",
                "style_notes_for_images": "수채화 스타일, 부드러운 파스텔 톤, 따뜻한 빛"
            }
        })
    }

    fn character_sheet(&self) -> serde_json::Value {
        json!({
            "name": "토끼",
            "master_description": "파란 조끼를 입은 귀여운 하얀 토끼로, 분홍색 코와 긴 하얀 귀가 특징입니다.",
            "appearance": {
                "age_visual": "어린 토끼",
                "face": "동그란 얼굴에 분홍색 코, 반짝이는 큰 검은 눈",
                "hair": "부드러운 하얀 털",
                "skin": "하얀 털 아래 분홍빛 피부",
                "body": "작고 통통한 체형, 솜털 꼬리"
            },
            "clothing": {
                "top": "밝은 파란색 조끼",
                "bottom": "없음",
                "shoes": "없음",
                "accessories": "없음"
            },
            "personality_traits": ["용감함", "호기심", "친절함"],
            "visual_style_notes": "수채화 스타일로 부드럽게 표현, 따뜻한 파스텔 톤"
        })
    }

    fn image_prompts(&self, user_prompt: &str) -> serde_json::Value {
        let pages = extract_u32(user_prompt, "page_count", 8);
        let style = extract(user_prompt, "style").unwrap_or("watercolor");
        let prompt_for = |i: u32| {
            json!({
                "page": i,
                "positive_prompt": format!(
                    "scene {i}: a cute white rabbit in a blue vest exploring a magical forest, children book illustration"
                ),
                "negative_prompt": "realistic, photograph, dark, scary, blurry, deformed",
                "seed": 1000 + i,
                "aspect_ratio": "3:4"
            })
        };
        json!({
            "style": style,
            "cover": prompt_for(0),
            "pages": (1..=pages).map(prompt_for).collect::<Vec<_>>(),
        })
    }

    fn rewrite(&self, user_prompt: &str) -> serde_json::Value {
        let age = extract(user_prompt, "target_age").unwrap_or("5-7");
        let page = extract_u32(user_prompt, "page", 1);
        json!({ "revised_text": Self::page_text(age, page) })
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let system = request.system_prompt.as_str();
        let payload = if system.contains("content safety classifier") {
            json!({"is_safe": true, "reasons": [], "suggestions": []})
        } else if system.contains("master character sheet") {
            self.character_sheet()
        } else if system.contains("image prompt engineer") {
            self.image_prompts(&request.user_prompt)
        } else if system.contains("rewrite") {
            self.rewrite(&request.user_prompt)
        } else if system.contains("story writer") {
            self.story(&request.user_prompt)
        } else {
            json!({"result": "mock response"})
        };

        Ok(payload.to_string())
    }
}

/// Mock image generator with failure scripting and concurrency observation.
pub struct MockImageClient {
    latency: Duration,
    /// Scripted failures per page, consumed front-to-back before succeeding.
    failures: Mutex<HashMap<u32, Vec<ImageError>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<HashMap<u32, u32>>,
}

impl MockImageClient {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(0),
            failures: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Script errors for a page; each generate() call for that page pops one
    /// until the script is exhausted, then succeeds.
    pub fn fail_page_with(self, page: u32, errors: Vec<ImageError>) -> Self {
        self.failures.lock().unwrap().insert(page, errors);
        self
    }

    /// Highest number of concurrently in-flight generate() calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of generate() calls made for a page.
    pub fn calls_for(&self, page: u32) -> u32 {
        self.calls.lock().unwrap().get(&page).copied().unwrap_or(0)
    }
}

impl Default for MockImageClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageClient for MockImageClient {
    async fn generate(&self, prompt: &ImagePrompt) -> Result<Bytes, ImageError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        *self.calls.lock().unwrap().entry(prompt.page).or_insert(0) += 1;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        } else {
            // Let sibling tasks start so max_in_flight is meaningful.
            tokio::task::yield_now().await;
        }

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&prompt.page)
            .and_then(|errors| {
                if errors.is_empty() {
                    None
                } else {
                    Some(errors.remove(0))
                }
            });

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match scripted {
            Some(err) => Err(err),
            None => Ok(Bytes::from(format!("png:{}:{}", prompt.page, prompt.seed))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_story::{ImagePrompts, StoryDraft};

    use crate::llm::parse_json_response;

    #[tokio::test]
    async fn mock_story_matches_requested_shape() {
        let llm = MockLlmClient::new();
        let request = LlmRequest::new(
            "You are a children's story writer.",
            "topic: 토끼\npage_count: 6\ntarget_age: 3-5\nlanguage: ko",
        );
        let response = llm.complete(&request).await.unwrap();
        let draft: StoryDraft = parse_json_response(&response).unwrap();
        assert!(draft.validate(6).is_ok());
        assert!(draft.age_rule_violations().is_empty());
    }

    #[tokio::test]
    async fn mock_adult_story_has_longer_pages() {
        let llm = MockLlmClient::new();
        let request = LlmRequest::new(
            "You are a children's story writer.",
            "page_count: 8\ntarget_age: adult\nlanguage: en",
        );
        let response = llm.complete(&request).await.unwrap();
        let draft: StoryDraft = parse_json_response(&response).unwrap();
        assert!(draft.age_rule_violations().is_empty());
    }

    #[tokio::test]
    async fn mock_image_prompts_parse() {
        let llm = MockLlmClient::new();
        let request = LlmRequest::new(
            "You are an image prompt engineer.",
            "page_count: 8\nstyle: watercolor",
        );
        let response = llm.complete(&request).await.unwrap();
        let prompts: ImagePrompts = parse_json_response(&response).unwrap();
        assert!(prompts.validate(8).is_ok());
    }

    #[tokio::test]
    async fn scripted_image_failures_are_consumed_in_order() {
        let image = MockImageClient::new().fail_page_with(
            4,
            vec![ImageError::RateLimited, ImageError::RateLimited],
        );
        let prompt = ImagePrompt {
            page: 4,
            positive_prompt: "p".to_string(),
            negative_prompt: "n".to_string(),
            seed: 1,
            aspect_ratio: Default::default(),
        };

        assert!(matches!(image.generate(&prompt).await, Err(ImageError::RateLimited)));
        assert!(matches!(image.generate(&prompt).await, Err(ImageError::RateLimited)));
        assert!(image.generate(&prompt).await.is_ok());
        assert_eq!(image.calls_for(4), 3);
    }
}
