//! Stage F: parallel image generation with bounded concurrency.
//!
//! Cover and pages fan out as sibling tasks under two semaphores: a per-job
//! cap and a process-wide cap protecting the provider's rate limit. Each
//! image carries its own attempt budget; exhausting any single image's
//! budget short-circuits the siblings and fails the stage — partial image
//! sets are never published.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use storyforge_core::{Clock, JobId};
use storyforge_providers::ImageClient;
use storyforge_story::{ImagePrompt, ImagePrompts};

use crate::config::EngineConfig;
use crate::error::{ErrorCode, PipelineError};
use crate::jobs::store::{JobStore, JobStoreError};

/// Progress checkpoint where the image stage starts.
pub const PROGRESS_IMAGES_START: u8 = 55;
/// Progress checkpoint when all images are done.
pub const PROGRESS_IMAGES_END: u8 = 95;

/// Generate the cover and every page image, returning bytes keyed by page
/// number (0 = cover).
pub async fn generate_all_images(
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    image: Arc<dyn ImageClient>,
    global_permits: Arc<Semaphore>,
    config: &EngineConfig,
    job_id: &JobId,
    prompts: &ImagePrompts,
) -> Result<HashMap<u32, Bytes>, PipelineError> {
    let total = prompts.total_images();
    let per_job_permits = Arc::new(Semaphore::new(config.image_max_concurrent));
    let completed = Arc::new(AtomicU32::new(0));

    let mut tasks: JoinSet<Result<(u32, Bytes), PipelineError>> = JoinSet::new();
    let all_prompts: Vec<ImagePrompt> = std::iter::once(prompts.cover.clone())
        .chain(prompts.pages.iter().cloned())
        .collect();

    for prompt in all_prompts {
        let store = store.clone();
        let clock = clock.clone();
        let image = image.clone();
        let per_job = per_job_permits.clone();
        let global = global_permits.clone();
        let completed = completed.clone();
        let job_id = job_id.clone();
        let timeout = config.image_timeout;
        let max_attempts = config.image_max_attempts;

        tasks.spawn(async move {
            let _per_job = per_job
                .acquire()
                .await
                .map_err(|_| PipelineError::new(ErrorCode::Unknown, "image stage cancelled"))?;
            let _global = global
                .acquire()
                .await
                .map_err(|_| PipelineError::new(ErrorCode::Unknown, "image stage cancelled"))?;

            let bytes =
                generate_single(&*image, &prompt, timeout, max_attempts, &job_id).await?;

            // Serialize the progress write on the job row; the store keeps
            // the max, so racing completions stay monotone.
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            let progress = PROGRESS_IMAGES_START
                + ((PROGRESS_IMAGES_END - PROGRESS_IMAGES_START) as u32 * done / total) as u8;
            let step = format!("images ({done}/{total})");
            match store
                .update_progress(&job_id, &step, progress, clock.now())
                .await
            {
                Ok(()) => {}
                Err(JobStoreError::Conflict(msg)) => {
                    // The monitor failed the job mid-flight; abort.
                    return Err(PipelineError::new(
                        ErrorCode::Unknown,
                        format!("job no longer live: {msg}"),
                    ));
                }
                Err(e) => return Err(PipelineError::db_write(e.to_string())),
            }

            Ok((prompt.page, bytes))
        });
    }

    let mut images = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((page, bytes))) => {
                images.insert(page, bytes);
            }
            Ok(Err(e)) => {
                tasks.abort_all();
                return Err(e);
            }
            Err(e) => {
                tasks.abort_all();
                return Err(PipelineError::new(
                    ErrorCode::Unknown,
                    format!("image task failed: {e}"),
                ));
            }
        }
    }

    Ok(images)
}

/// One image with its own deadline and attempt budget. Also used by page
/// regeneration.
pub async fn generate_single(
    image: &dyn ImageClient,
    prompt: &ImagePrompt,
    timeout: Duration,
    max_attempts: u32,
    job_id: &JobId,
) -> Result<Bytes, PipelineError> {
    let mut last_error: Option<PipelineError> = None;

    for attempt in 0..max_attempts {
        let result = match tokio::time::timeout(timeout, image.generate(prompt)).await {
            Ok(result) => result.map_err(PipelineError::from),
            Err(_) => Err(PipelineError::new(
                ErrorCode::ImageTimeout,
                "image deadline elapsed",
            )),
        };

        match result {
            Ok(bytes) => {
                tracing::info!(
                    job_id = %job_id,
                    page = prompt.page,
                    attempt = attempt + 1,
                    "image generated"
                );
                return Ok(bytes);
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job_id,
                    page = prompt.page,
                    attempt = attempt + 1,
                    code = %e.code,
                    "image attempt failed"
                );
                if attempt + 1 < max_attempts {
                    let wait = e.code.backoff_secs(attempt);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                last_error = Some(e);
            }
        }
    }

    let last = last_error
        .map(|e| e.message)
        .unwrap_or_else(|| "no attempts made".to_string());
    Err(PipelineError::new(
        ErrorCode::ImageFailed,
        format!("page {} exhausted its attempt budget: {last}", prompt.page),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use storyforge_core::{
        BookSpec, Language, ManualClock, Style, SystemClock, TargetAge, UserKey,
    };
    use storyforge_providers::{ImageError, MockImageClient};
    use storyforge_story::AspectRatio;

    use crate::jobs::{InMemoryJobStore, Job};

    fn spec(pages: u32) -> BookSpec {
        BookSpec {
            topic: "test topic".to_string(),
            language: Language::Ko,
            target_age: TargetAge::Age5To7,
            style: Style::Watercolor,
            page_count: pages,
            theme: None,
            character: None,
            character_id: None,
            character_ids: Vec::new(),
            forbidden_elements: Vec::new(),
        }
    }

    fn prompts(pages: u32) -> ImagePrompts {
        let prompt = |page: u32| ImagePrompt {
            page,
            positive_prompt: format!("scene {page}"),
            negative_prompt: "text".to_string(),
            seed: page + 1,
            aspect_ratio: AspectRatio::Portrait,
        };
        ImagePrompts {
            style: Style::Watercolor,
            cover: prompt(0),
            pages: (1..=pages).map(prompt).collect(),
        }
    }

    async fn seeded(pages: u32) -> (Arc<InMemoryJobStore>, JobId) {
        let store = Arc::new(InMemoryJobStore::new());
        let job = Job::new(
            UserKey::new("image-test-user").unwrap(),
            spec(pages),
            None,
            Utc::now(),
        );
        let id = job.id.clone();
        store.insert(job).await.unwrap();
        store
            .update_progress(&id, "prompts", PROGRESS_IMAGES_START, Utc::now())
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn semaphore_caps_in_flight_calls() {
        let (store, id) = seeded(8).await;
        let config = EngineConfig::default();
        let image = Arc::new(
            MockImageClient::new().with_latency(Duration::from_millis(20)),
        );

        let images = generate_all_images(
            store,
            Arc::new(SystemClock),
            image.clone(),
            Arc::new(Semaphore::new(config.image_global_concurrent)),
            &config,
            &id,
            &prompts(8),
        )
        .await
        .unwrap();

        assert_eq!(images.len(), 9);
        assert!(image.max_in_flight() <= 3, "observed {}", image.max_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_rate_limits_retry_with_longer_backoff() {
        let (store, id) = seeded(8).await;
        let config = EngineConfig::default();
        let image = Arc::new(MockImageClient::new().fail_page_with(
            4,
            vec![ImageError::RateLimited, ImageError::RateLimited],
        ));

        let started = tokio::time::Instant::now();
        let images = generate_all_images(
            store.clone(),
            Arc::new(SystemClock),
            image.clone(),
            Arc::new(Semaphore::new(config.image_global_concurrent)),
            &config,
            &id,
            &prompts(8),
        )
        .await
        .unwrap();

        assert_eq!(images.len(), 9);
        assert_eq!(image.calls_for(4), 3);
        // Two rate-limit backoffs for page 4: 5s then 10s.
        assert_eq!(started.elapsed(), Duration::from_secs(15));

        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.progress, PROGRESS_IMAGES_END);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_fails_the_stage_terminally() {
        let (store, id) = seeded(6).await;
        let config = EngineConfig::default();
        let image = Arc::new(MockImageClient::new().fail_page_with(
            3,
            vec![
                ImageError::Provider("boom".to_string()),
                ImageError::Provider("boom".to_string()),
                ImageError::Provider("boom".to_string()),
            ],
        ));

        let err = generate_all_images(
            store,
            Arc::new(SystemClock),
            image,
            Arc::new(Semaphore::new(config.image_global_concurrent)),
            &config,
            &id,
            &prompts(6),
        )
        .await
        .unwrap_err();

        assert_eq!(err.code, ErrorCode::ImageFailed);
        assert!(err.message.contains("page 3"));
    }

    #[tokio::test]
    async fn aborts_when_the_monitor_kills_the_job() {
        let (store, id) = seeded(6).await;
        let config = EngineConfig::default();
        store
            .fail(&id, ErrorCode::SlaBreach, "over sla", Utc::now())
            .await
            .unwrap();

        let clock = Arc::new(ManualClock::from_system());
        let err = generate_all_images(
            store,
            clock,
            Arc::new(MockImageClient::new()),
            Arc::new(Semaphore::new(config.image_global_concurrent)),
            &config,
            &id,
            &prompts(6),
        )
        .await
        .unwrap_err();

        assert!(err.message.contains("no longer live"));
    }
}
