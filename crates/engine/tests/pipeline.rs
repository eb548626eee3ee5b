//! End-to-end pipeline tests over the in-memory stores and mock providers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;

use storyforge_core::{
    BookSpec, CharacterId, Clock, JobId, Language, ManualClock, Style, TargetAge, UserKey,
};
use storyforge_credits::{CreditLedger, InMemoryCreditLedger, TransactionKind};
use storyforge_engine::artifacts::{ArtifactStore, InMemoryArtifactStore};
use storyforge_engine::characters::{CharacterStore, InMemoryCharacterStore};
use storyforge_engine::jobs::store::JobStore;
use storyforge_engine::library::{BookStore, InMemoryBookStore};
use storyforge_engine::{
    EngineConfig, ErrorCode, InMemoryJobStore, Job, JobState, Orchestrator, ProviderSet,
    RegenerateTarget,
};
use storyforge_providers::{
    ImageError, InMemoryObjectStore, LexiconModeration, MockImageClient, MockLlmClient,
};
use storyforge_story::{Character, CharacterSheet};

struct Fixture {
    orchestrator: Orchestrator,
    jobs: Arc<InMemoryJobStore>,
    books: Arc<InMemoryBookStore>,
    artifacts: Arc<InMemoryArtifactStore>,
    characters: Arc<InMemoryCharacterStore>,
    ledger: Arc<InMemoryCreditLedger>,
    storage: Arc<InMemoryObjectStore>,
    image: Arc<MockImageClient>,
    clock: Arc<ManualClock>,
}

fn fixture_with_image(image: MockImageClient) -> Fixture {
    let clock = Arc::new(ManualClock::from_system());
    let jobs = Arc::new(InMemoryJobStore::new());
    let books = Arc::new(InMemoryBookStore::new());
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let characters = Arc::new(InMemoryCharacterStore::new());
    let ledger = Arc::new(InMemoryCreditLedger::with_clock(clock.clone()));
    let storage = Arc::new(InMemoryObjectStore::default());
    let image = Arc::new(image);

    let providers = ProviderSet {
        llm: Arc::new(MockLlmClient::new()),
        image: image.clone(),
        moderation: Arc::new(LexiconModeration),
        storage: storage.clone(),
    };

    let orchestrator = Orchestrator::new(
        jobs.clone(),
        artifacts.clone(),
        books.clone(),
        characters.clone(),
        ledger.clone(),
        providers,
        EngineConfig::default(),
        clock.clone(),
    );

    Fixture {
        orchestrator,
        jobs,
        books,
        artifacts,
        characters,
        ledger,
        storage,
        image,
        clock,
    }
}

fn fixture() -> Fixture {
    fixture_with_image(MockImageClient::new())
}

fn spec() -> BookSpec {
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

fn user() -> UserKey {
    UserKey::new("pipeline-user-1").unwrap()
}

/// Insert a queued job the way admission would: one debit, one row.
async fn admit(f: &Fixture, spec: BookSpec) -> JobId {
    let job = Job::new(user(), spec, None, f.clock.now());
    let id = job.id.clone();
    f.ledger
        .debit(&user(), 1, "book_generation", Some(&id))
        .await
        .unwrap();
    f.jobs.insert(job).await.unwrap();
    id
}

async fn refund_count(f: &Fixture) -> usize {
    f.ledger
        .transactions(&user(), usize::MAX)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TransactionKind::Refund)
        .count()
}

#[tokio::test]
async fn happy_path_produces_a_complete_book() {
    let f = fixture();
    let job_id = admit(&f, spec()).await;

    f.orchestrator.run_job(job_id.clone()).await;

    let job = f.jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Done);
    assert_eq!(job.progress, 100);
    assert!(job.moderation_input.as_ref().unwrap().is_safe);
    assert!(job.moderation_output.as_ref().unwrap().is_safe);

    let book = f.books.get_by_job(&job_id).await.unwrap().unwrap();
    assert_eq!(book.pages.len(), 8);
    assert!(!book.cover_image_url.is_empty());
    for page in &book.pages {
        assert!(!page.text.is_empty());
        assert!(!page.image_url.is_empty());
        assert!(!page.image_prompt.is_empty());
    }

    // Cover + 8 pages uploaded under the book's key layout.
    assert_eq!(f.storage.len(), 9);
    assert!(f
        .storage
        .get(&format!("books/{}/cover.png", book.id))
        .is_some());

    // One debit, zero refunds.
    assert_eq!(refund_count(&f).await, 0);
    assert_eq!(f.ledger.balance(&user()).await.unwrap(), 9);

    // Intermediate artifacts persisted.
    assert!(f.artifacts.load_draft(&job_id).await.unwrap().is_some());
    let prompts = f.artifacts.load_prompts(&job_id).await.unwrap().unwrap();

    // Every prompt embeds the character's master description verbatim.
    let characters = f.characters.list_for_user(&user()).await.unwrap();
    assert!(prompts.embeds_master_description(&characters[0].sheet.master_description));
}

#[tokio::test]
async fn page_count_boundaries_succeed() {
    for pages in [6u32, 12] {
        let f = fixture();
        let mut s = spec();
        s.page_count = pages;
        let job_id = admit(&f, s).await;

        f.orchestrator.run_job(job_id.clone()).await;

        let job = f.jobs.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobState::Done, "page_count={pages}");
        let book = f.books.get_by_job(&job_id).await.unwrap().unwrap();
        assert_eq!(book.pages.len() as u32, pages);
    }
}

#[tokio::test]
async fn unsafe_input_fails_with_safety_input_and_refunds() {
    let f = fixture();
    let mut s = spec();
    s.topic = "총 싸움 이야기".to_string();
    let job_id = admit(&f, s).await;

    f.orchestrator.run_job(job_id.clone()).await;

    let job = f.jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Failed);
    assert_eq!(job.error_code, Some(ErrorCode::SafetyInput));
    assert!(!job.moderation_input.unwrap().is_safe);

    // Refund recorded, no book row, nothing uploaded.
    assert_eq!(refund_count(&f).await, 1);
    assert_eq!(f.ledger.balance(&user()).await.unwrap(), 10);
    assert!(f.books.get_by_job(&job_id).await.unwrap().is_none());
    assert!(f.storage.is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_image_rate_limits_recover_with_backoff() {
    let f = fixture_with_image(MockImageClient::new().fail_page_with(
        4,
        vec![ImageError::RateLimited, ImageError::RateLimited],
    ));
    let job_id = admit(&f, spec()).await;

    let started = tokio::time::Instant::now();
    f.orchestrator.run_job(job_id.clone()).await;

    let job = f.jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Done);
    assert_eq!(f.image.calls_for(4), 3);
    // The two rate-limit backoffs dominate the virtual latency: 5s + 10s.
    assert_eq!(started.elapsed(), Duration::from_secs(15));
    assert_eq!(refund_count(&f).await, 0);
}

#[tokio::test(start_paused = true)]
async fn image_budget_exhaustion_fails_the_job_without_a_book() {
    let f = fixture_with_image(MockImageClient::new().fail_page_with(
        2,
        vec![
            ImageError::Provider("boom".to_string()),
            ImageError::Provider("boom".to_string()),
            ImageError::Provider("boom".to_string()),
        ],
    ));
    let job_id = admit(&f, spec()).await;

    f.orchestrator.run_job(job_id.clone()).await;

    let job = f.jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Failed);
    assert_eq!(job.error_code, Some(ErrorCode::ImageFailed));

    // No partial book published, refund recorded, draft kept for forensics.
    assert!(f.books.get_by_job(&job_id).await.unwrap().is_none());
    assert!(f.storage.is_empty());
    assert_eq!(refund_count(&f).await, 1);
    assert!(f.artifacts.load_draft(&job_id).await.unwrap().is_some());
}

#[tokio::test]
async fn sla_breach_mid_pipeline_aborts_and_refunds() {
    let f = fixture();
    let job_id = admit(&f, spec()).await;

    // The job was admitted long ago in wall-clock terms.
    f.clock.advance(ChronoDuration::seconds(601));
    f.orchestrator.run_job(job_id.clone()).await;

    let job = f.jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Failed);
    assert_eq!(job.error_code, Some(ErrorCode::SlaBreach));
    assert!(f.books.get_by_job(&job_id).await.unwrap().is_none());
    assert_eq!(refund_count(&f).await, 1);
}

#[tokio::test]
async fn referenced_character_skips_stage_d_and_anchors_prompts() {
    let f = fixture();

    let sheet = CharacterSheet {
        name: "바다거북".to_string(),
        master_description: "등딱지에 별무늬가 있는 초록 바다거북, 노란 스카프를 두르고 있습니다."
            .to_string(),
        appearance: storyforge_story::CharacterAppearance {
            age_visual: "어린 거북".to_string(),
            face: "둥근 눈".to_string(),
            hair: "없음".to_string(),
            skin: "초록 피부".to_string(),
            body: "단단한 등딱지".to_string(),
        },
        clothing: storyforge_story::CharacterClothing {
            top: "노란 스카프".to_string(),
            bottom: "없음".to_string(),
            shoes: "없음".to_string(),
            accessories: "없음".to_string(),
        },
        personality_traits: vec!["느긋함".to_string()],
        visual_style_notes: "수채화".to_string(),
    };
    let character = Character {
        id: CharacterId::new(),
        user_key: user(),
        sheet: sheet.clone(),
        created_at: f.clock.now(),
    };
    f.characters.insert(character.clone()).await.unwrap();

    let mut s = spec();
    s.character_id = Some(character.id.clone());
    let job_id = admit(&f, s).await;

    f.orchestrator.run_job(job_id.clone()).await;

    let job = f.jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Done);

    // No new character was generated; the prompts anchor to the loaded one.
    assert_eq!(f.characters.list_for_user(&user()).await.unwrap().len(), 1);
    let prompts = f.artifacts.load_prompts(&job_id).await.unwrap().unwrap();
    assert!(prompts.embeds_master_description(&sheet.master_description));
}

#[tokio::test]
async fn regenerate_page_replaces_text_and_image() {
    let f = fixture();
    let job_id = admit(&f, spec()).await;
    f.orchestrator.run_job(job_id.clone()).await;

    let before = f.books.get_by_job(&job_id).await.unwrap().unwrap();
    let page_before = before.pages.iter().find(|p| p.page_number == 3).unwrap().clone();

    f.orchestrator
        .regenerate_page(&job_id, 3, RegenerateTarget::Both, Some("make it calmer".to_string()))
        .await
        .unwrap();

    let after = f.books.get_by_job(&job_id).await.unwrap().unwrap();
    let page_after = after.pages.iter().find(|p| p.page_number == 3).unwrap();
    assert!(!page_after.text.is_empty());
    assert_eq!(page_after.image_url, page_before.image_url); // same storage key
    // Other pages untouched.
    assert_eq!(
        after.pages.iter().filter(|p| p.page_number != 3).count(),
        7
    );
}

#[tokio::test]
async fn run_job_is_a_no_op_for_terminal_jobs() {
    let f = fixture();
    let job_id = admit(&f, spec()).await;
    f.jobs
        .fail(&job_id, ErrorCode::SlaBreach, "already failed", f.clock.now())
        .await
        .unwrap();

    f.orchestrator.run_job(job_id.clone()).await;

    let job = f.jobs.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.error_code, Some(ErrorCode::SlaBreach));
    assert!(f.storage.is_empty());
}
