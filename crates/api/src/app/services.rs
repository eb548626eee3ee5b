use std::sync::Arc;
use std::time::Duration;

use storyforge_core::{Clock, SystemClock};
use storyforge_credits::{CreditLedger, InMemoryCreditLedger};
use storyforge_engine::artifacts::{ArtifactStore, InMemoryArtifactStore};
use storyforge_engine::characters::{CharacterStore, InMemoryCharacterStore};
use storyforge_engine::library::{BookStore, InMemoryBookStore};
use storyforge_engine::{
    AdmissionController, EngineConfig, InMemoryJobStore, InMemoryRateLimitStore, JobMonitor,
    JobStore, Orchestrator, ProviderSet, SlidingWindowLimiter, TokioDispatcher,
};
use storyforge_providers::llm::{AnthropicClient, OpenAiClient};
use storyforge_providers::storage::HttpObjectStore;
use storyforge_providers::{
    ContentModeration, ImageClient, InMemoryObjectStore, LexiconModeration, LlmClient,
    LlmModeration, MockImageClient, MockLlmClient, ObjectStore,
};
use storyforge_providers::image::{FalClient, ReplicateClient};

/// Everything the HTTP handlers need.
pub struct AppServices {
    pub admission: AdmissionController,
    pub orchestrator: Arc<Orchestrator>,
    pub monitor: Arc<JobMonitor>,
    pub jobs: Arc<dyn JobStore>,
    pub books: Arc<dyn BookStore>,
    pub characters: Arc<dyn CharacterStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub ledger: Arc<dyn CreditLedger>,
    pub config: EngineConfig,
    pub llm_provider: String,
    pub image_provider: String,
    pub storage_backend: String,
}

/// Wire the default stack: in-memory stores, env-selected providers, and a
/// running monitor. Providers default to the mocks so a bare process serves
/// complete books without network access.
pub async fn build_services(config: EngineConfig) -> AppServices {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let jobs: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let books: Arc<dyn BookStore> = Arc::new(InMemoryBookStore::new());
    let characters: Arc<dyn CharacterStore> = Arc::new(InMemoryCharacterStore::new());
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
    let ledger: Arc<InMemoryCreditLedger> = Arc::new(
        InMemoryCreditLedger::with_clock(clock.clone())
            .with_signup_bonus(config.signup_bonus_credits),
    );
    let ledger: Arc<dyn CreditLedger> = ledger;

    let (llm, llm_provider) = build_llm(&config);
    let (image, image_provider) = build_image(&config);
    let (storage, storage_backend) = build_storage();
    let moderation: Arc<dyn ContentModeration> = if llm_provider == "mock" {
        Arc::new(LexiconModeration)
    } else {
        Arc::new(LlmModeration::new(llm.clone()))
    };

    let providers = ProviderSet {
        llm,
        image,
        moderation,
        storage,
    };

    let orchestrator = Arc::new(Orchestrator::new(
        jobs.clone(),
        artifacts.clone(),
        books.clone(),
        characters.clone(),
        ledger.clone(),
        providers,
        config.clone(),
        clock.clone(),
    ));

    let dispatcher = Arc::new(TokioDispatcher::new(orchestrator.clone()));

    let limiter = SlidingWindowLimiter::new(
        Arc::new(InMemoryRateLimitStore::new()),
        clock.clone(),
        config.rate_limit_requests,
        config.rate_limit_window,
    );

    let admission = AdmissionController::new(
        jobs.clone(),
        ledger.clone(),
        limiter,
        dispatcher.clone(),
        config.clone(),
        clock.clone(),
    );

    let monitor = Arc::new(JobMonitor::new(
        jobs.clone(),
        ledger.clone(),
        dispatcher,
        config.clone(),
        clock,
    ));
    monitor.clone().spawn();

    AppServices {
        admission,
        orchestrator,
        monitor,
        jobs,
        books,
        characters,
        artifacts,
        ledger,
        config,
        llm_provider,
        image_provider,
        storage_backend,
    }
}

fn build_llm(config: &EngineConfig) -> (Arc<dyn LlmClient>, String) {
    let provider =
        std::env::var("STORYFORGE_LLM_PROVIDER").unwrap_or_else(|_| "mock".to_string());
    let api_key = std::env::var("STORYFORGE_LLM_API_KEY").unwrap_or_default();
    let client: Arc<dyn LlmClient> = match provider.as_str() {
        "openai" => {
            let model = std::env::var("STORYFORGE_LLM_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string());
            Arc::new(OpenAiClient::new(api_key, model, config.llm_timeout))
        }
        "anthropic" => {
            let model = std::env::var("STORYFORGE_LLM_MODEL")
                .unwrap_or_else(|_| "claude-3-5-haiku-latest".to_string());
            Arc::new(AnthropicClient::new(api_key, model, config.llm_timeout))
        }
        _ => Arc::new(MockLlmClient::new()),
    };
    (client, provider)
}

fn build_image(config: &EngineConfig) -> (Arc<dyn ImageClient>, String) {
    let provider =
        std::env::var("STORYFORGE_IMAGE_PROVIDER").unwrap_or_else(|_| "mock".to_string());
    let api_key = std::env::var("STORYFORGE_IMAGE_API_KEY").unwrap_or_default();
    let client: Arc<dyn ImageClient> = match provider.as_str() {
        "replicate" => Arc::new(ReplicateClient::new(api_key, config.image_timeout)),
        "fal" => Arc::new(FalClient::new(api_key, config.image_timeout)),
        _ => Arc::new(MockImageClient::new().with_latency(Duration::from_millis(50))),
    };
    (client, provider)
}

fn build_storage() -> (Arc<dyn ObjectStore>, String) {
    match std::env::var("STORYFORGE_S3_ENDPOINT") {
        Ok(endpoint) => {
            let bucket = std::env::var("STORYFORGE_S3_BUCKET")
                .unwrap_or_else(|_| "storyforge".to_string());
            let public_url = std::env::var("STORYFORGE_S3_PUBLIC_URL")
                .unwrap_or_else(|_| format!("{endpoint}/{bucket}"));
            (
                Arc::new(HttpObjectStore::new(
                    endpoint,
                    bucket,
                    public_url,
                    Duration::from_secs(30),
                )),
                "s3".to_string(),
            )
        }
        Err(_) => (
            Arc::new(InMemoryObjectStore::default()),
            "memory".to_string(),
        ),
    }
}
