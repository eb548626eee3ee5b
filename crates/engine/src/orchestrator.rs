//! The orchestrator: stages A–H for one job.
//!
//! Drives a linear pipeline with fixed progress checkpoints (A:5 B:10 C:30
//! D:40 E:55 F:55→95 G:95 H:100), persisting each stage's output before
//! progress advances. Terminal failure writes the error code to the job row
//! and refunds the admission debit; intermediate artifacts stay in place for
//! forensics, and a partial book is never published.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::Instrument;

use storyforge_core::{policy, BookId, CharacterId, Clock, JobId};
use storyforge_credits::CreditLedger;
use storyforge_providers::{
    parse_json_response, ContentModeration, ImageClient, LlmClient, ModerationVerdict,
    ObjectStore,
};
use storyforge_story::{Book, Character, CharacterSheet, ImagePrompts, Page, StoryDraft};

use crate::artifacts::ArtifactStore;
use crate::characters::CharacterStore;
use crate::config::EngineConfig;
use crate::error::{ErrorCode, PipelineError};
use crate::images;
use crate::jobs::store::{JobStore, ModerationSide};
use crate::jobs::types::Job;
use crate::library::BookStore;
use crate::prompts;
use crate::stage::{run_stage, StagePolicy};

/// Refund reason shared by the orchestrator and the monitor so the ledger's
/// `(job_id, reason)` idempotence covers their race.
pub const REFUND_REASON: &str = "job_failed";

const IMAGE_CONTENT_TYPE: &str = "image/png";
const IMAGE_EXT: &str = "png";

/// Rewrite cycles allowed during output moderation before the job fails.
const MAX_REWRITE_CYCLES: u32 = 2;

/// The capability ports the pipeline calls out to.
#[derive(Clone)]
pub struct ProviderSet {
    pub llm: Arc<dyn LlmClient>,
    pub image: Arc<dyn ImageClient>,
    pub moderation: Arc<dyn ContentModeration>,
    pub storage: Arc<dyn ObjectStore>,
}

/// What to regenerate for a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegenerateTarget {
    Text,
    Image,
    Both,
}

impl RegenerateTarget {
    fn wants_text(&self) -> bool {
        matches!(self, RegenerateTarget::Text | RegenerateTarget::Both)
    }

    fn wants_image(&self) -> bool {
        matches!(self, RegenerateTarget::Image | RegenerateTarget::Both)
    }
}

pub struct Orchestrator {
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    books: Arc<dyn BookStore>,
    characters: Arc<dyn CharacterStore>,
    ledger: Arc<dyn CreditLedger>,
    providers: ProviderSet,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    /// Process-wide cap on concurrent image calls, shared across jobs.
    image_permits: Arc<Semaphore>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactStore>,
        books: Arc<dyn BookStore>,
        characters: Arc<dyn CharacterStore>,
        ledger: Arc<dyn CreditLedger>,
        providers: ProviderSet,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let image_permits = Arc::new(Semaphore::new(config.image_global_concurrent));
        Self {
            jobs,
            artifacts,
            books,
            characters,
            ledger,
            providers,
            config,
            clock,
            image_permits,
        }
    }

    /// Run one job to completion, failure, or SLA breach. The entry point
    /// for the dispatcher; never panics the task on pipeline errors.
    pub async fn run_job(&self, job_id: JobId) {
        let span = storyforge_observability::job_span(job_id.as_str());
        self.run_job_inner(job_id).instrument(span).await
    }

    async fn run_job_inner(&self, job_id: JobId) {
        let job = match self.jobs.get(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::error!(job_id = %job_id, "dispatched job not found");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "failed to load dispatched job");
                return;
            }
        };
        if job.status.is_terminal() {
            tracing::debug!(job_id = %job_id, "job already terminal, skipping");
            return;
        }

        tracing::info!(job_id = %job_id, topic = %job.spec.topic, "starting book generation");

        match self.execute(&job).await {
            Ok(book_id) => {
                tracing::info!(job_id = %job_id, book_id = %book_id, "book generation completed");
            }
            Err(e) => {
                self.fail_and_refund(&job, &e).await;
            }
        }
    }

    /// Mark the job failed (first writer wins) and refund the admission
    /// debit. The refund is idempotent per `(job_id, reason)`, so losing the
    /// failure race to the monitor costs nothing.
    async fn fail_and_refund(&self, job: &Job, error: &PipelineError) {
        tracing::error!(
            job_id = %job.id,
            code = %error.code,
            error = %error.message,
            "book generation failed"
        );

        match self
            .jobs
            .fail(&job.id, error.code, &error.message, self.clock.now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job_id = %job.id, "job already terminal, keeping earlier verdict");
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to persist job failure");
            }
        }

        if let Err(e) = self
            .ledger
            .refund(&job.user_key, 1, REFUND_REASON, &job.id)
            .await
        {
            tracing::error!(job_id = %job.id, error = %e, "refund failed");
        }
    }

    fn check_sla(&self, job: &Job) -> Result<(), PipelineError> {
        if job.is_over_sla(self.clock.now(), self.config.sla) {
            return Err(PipelineError::sla_breach(format!(
                "job exceeded SLA of {}s",
                self.config.sla.as_secs()
            )));
        }
        Ok(())
    }

    async fn execute(&self, job: &Job) -> Result<BookId, PipelineError> {
        let store = self.jobs.as_ref();
        let clock = self.clock.as_ref();

        // A. Normalize: canonical spec + resolved character references.
        let policy_a = StagePolicy::cpu("normalizing input", 5);
        let spec = job.spec.clone();
        let (spec, loaded_characters) = run_stage(store, clock, &job.id, &policy_a, || {
            let spec = spec.clone();
            async move {
                spec.validate()
                    .map_err(|e| PipelineError::new(ErrorCode::Unknown, e.to_string()))?;
                let spec = spec.normalized();
                let loaded = self.load_characters(spec.character_refs()).await?;
                Ok((spec, loaded))
            }
        })
        .await?;

        // B. Input moderation.
        let policy_b = StagePolicy {
            name: "moderating input",
            progress: 10,
            timeout: Some(std::time::Duration::from_secs(10)),
            retries: 0,
            timeout_code: ErrorCode::LlmTimeout,
        };
        let input_text = prompts::moderation_input_text(&spec);
        let verdict = run_stage(store, clock, &job.id, &policy_b, || {
            let input_text = input_text.clone();
            async move {
                self.providers
                    .moderation
                    .classify_text(&input_text)
                    .await
                    .map_err(PipelineError::from)
            }
        })
        .await?;
        self.jobs
            .record_moderation(&job.id, ModerationSide::Input, verdict.clone(), clock.now())
            .await
            .map_err(|e| PipelineError::db_write(e.to_string()))?;
        if !verdict.is_safe {
            return Err(PipelineError::safety_input(format!(
                "input rejected: {}",
                verdict.reasons.join(", ")
            )));
        }
        self.check_sla(job)?;

        // C. Story draft.
        let policy_c = StagePolicy {
            name: "writing story",
            progress: 30,
            timeout: Some(self.config.llm_timeout),
            retries: 2,
            timeout_code: ErrorCode::LlmTimeout,
        };
        let briefs: Vec<String> = loaded_characters
            .iter()
            .map(|c| format!("{}: {}", c.sheet.name, c.sheet.master_description))
            .collect();
        let draft = run_stage(store, clock, &job.id, &policy_c, || {
            let request = prompts::story_request(&spec, &briefs);
            let page_count = spec.page_count;
            let forbidden = spec.forbidden_elements.clone();
            async move {
                let response = self.providers.llm.complete(&request).await?;
                let draft: StoryDraft = parse_json_response(&response)?;
                draft
                    .validate(page_count)
                    .map_err(|e| PipelineError::new(ErrorCode::LlmJsonInvalid, e.to_string()))?;

                let violations = draft.age_rule_violations();
                if let Some((page, rule)) = violations.first() {
                    return Err(PipelineError::safety_output(format!(
                        "page {page} violates the age rule: {rule}"
                    )));
                }
                if let Some(token) = policy::find_banned(&draft.all_text()) {
                    return Err(PipelineError::safety_output(format!(
                        "draft contains banned token: {token}"
                    )));
                }
                if let Some(element) = policy::find_forbidden(&draft.all_text(), &forbidden) {
                    return Err(PipelineError::safety_output(format!(
                        "draft contains forbidden element: {element}"
                    )));
                }
                Ok(draft)
            }
        })
        .await?;
        self.artifacts
            .save_draft(&job.id, &draft)
            .await
            .map_err(|e| PipelineError::db_write(e.to_string()))?;
        self.check_sla(job)?;

        // D. Character sheet: loaded reference wins, otherwise generate and
        // persist a new character.
        let sheet = if let Some(character) = loaded_characters.first() {
            self.jobs
                .update_progress(&job.id, "loading character", 40, clock.now())
                .await
                .map_err(|e| PipelineError::db_write(e.to_string()))?;
            character.sheet.clone()
        } else {
            let policy_d = StagePolicy {
                name: "designing character",
                progress: 40,
                timeout: Some(std::time::Duration::from_secs(20)),
                retries: 1,
                timeout_code: ErrorCode::LlmTimeout,
            };
            let sheet = run_stage(store, clock, &job.id, &policy_d, || {
                let request = prompts::character_sheet_request(&spec, &draft);
                async move {
                    let response = self.providers.llm.complete(&request).await?;
                    let sheet: CharacterSheet = parse_json_response(&response)?;
                    sheet.validate().map_err(|e| {
                        PipelineError::new(ErrorCode::LlmJsonInvalid, e.to_string())
                    })?;
                    Ok(sheet)
                }
            })
            .await?;

            let character = Character {
                id: CharacterId::new(),
                user_key: job.user_key.clone(),
                sheet: sheet.clone(),
                created_at: clock.now(),
            };
            self.characters
                .insert(character)
                .await
                .map_err(|e| PipelineError::db_write(e.to_string()))?;
            sheet
        };
        self.check_sla(job)?;

        // E. Image prompts, constraint-enforced and persisted.
        let policy_e = StagePolicy {
            name: "preparing prompts",
            progress: 55,
            timeout: Some(self.config.llm_timeout),
            retries: 1,
            timeout_code: ErrorCode::LlmTimeout,
        };
        let image_prompts = run_stage(store, clock, &job.id, &policy_e, || {
            let request = prompts::image_prompts_request(&spec, &draft, &sheet);
            let master = sheet.master_description.clone();
            let page_count = spec.page_count;
            async move {
                let response = self.providers.llm.complete(&request).await?;
                let mut prompts: ImagePrompts = parse_json_response(&response)?;
                prompts
                    .validate(page_count)
                    .map_err(|e| PipelineError::new(ErrorCode::LlmJsonInvalid, e.to_string()))?;
                prompts.enforce(&master);
                Ok(prompts)
            }
        })
        .await?;
        self.artifacts
            .save_prompts(&job.id, &image_prompts)
            .await
            .map_err(|e| PipelineError::db_write(e.to_string()))?;
        self.check_sla(job)?;

        // F. Images, in parallel under the concurrency caps.
        let image_bytes = images::generate_all_images(
            self.jobs.clone(),
            self.clock.clone(),
            self.providers.image.clone(),
            self.image_permits.clone(),
            &self.config,
            &job.id,
            &image_prompts,
        )
        .await?;
        self.check_sla(job)?;

        // G. Output moderation with bounded rewrite cycles.
        let draft = self.moderate_output(job, &spec, draft).await?;
        self.check_sla(job)?;

        // H. Package: upload, then book + pages + done.
        let book_id = BookId::new();
        let policy_h = StagePolicy {
            name: "packaging",
            progress: 95,
            timeout: Some(std::time::Duration::from_secs(30)),
            retries: 1,
            timeout_code: ErrorCode::StorageUploadFailed,
        };
        run_stage(store, clock, &job.id, &policy_h, || {
            let book_id = book_id.clone();
            let draft = draft.clone();
            let image_prompts = image_prompts.clone();
            let image_bytes = image_bytes.clone();
            let spec = spec.clone();
            async move {
                self.package(job, &spec, book_id, &draft, &image_prompts, image_bytes)
                    .await
            }
        })
        .await?;

        match self.jobs.complete(&job.id, clock.now()).await {
            Ok(true) => Ok(book_id),
            Ok(false) => {
                // Lost the race to the monitor (e.g. SLA breach during H).
                // The book row exists for forensics; the refund side stays
                // consistent because both writers share the refund reason.
                tracing::warn!(job_id = %job.id, "job completed but was already terminal");
                Ok(book_id)
            }
            Err(e) => Err(PipelineError::db_write(e.to_string())),
        }
    }

    async fn load_characters(
        &self,
        refs: Vec<CharacterId>,
    ) -> Result<Vec<Character>, PipelineError> {
        let mut loaded = Vec::new();
        for id in refs {
            match self.characters.get(&id).await {
                Ok(Some(character)) => loaded.push(character),
                Ok(None) => {
                    tracing::warn!(character_id = %id, "referenced character not found, skipping");
                }
                Err(e) => return Err(PipelineError::db_write(e.to_string())),
            }
        }
        Ok(loaded)
    }

    /// Stage G: re-check the draft against the safety rules, rewriting
    /// offending pages up to `MAX_REWRITE_CYCLES` times before giving up.
    async fn moderate_output(
        &self,
        job: &Job,
        spec: &storyforge_core::BookSpec,
        mut draft: StoryDraft,
    ) -> Result<StoryDraft, PipelineError> {
        self.jobs
            .update_progress(&job.id, "moderating output", 95, self.clock.now())
            .await
            .map_err(|e| PipelineError::db_write(e.to_string()))?;

        for cycle in 0..=MAX_REWRITE_CYCLES {
            let offending: Vec<(u32, String)> = draft
                .pages
                .iter()
                .filter_map(|p| {
                    policy::find_banned(&p.text)
                        .map(str::to_string)
                        .or_else(|| {
                            policy::find_forbidden(&p.text, &spec.forbidden_elements)
                                .map(str::to_string)
                        })
                        .map(|token| (p.page, token))
                })
                .collect();

            if offending.is_empty() {
                let verdict = ModerationVerdict::safe();
                self.jobs
                    .record_moderation(
                        &job.id,
                        ModerationSide::Output,
                        verdict,
                        self.clock.now(),
                    )
                    .await
                    .map_err(|e| PipelineError::db_write(e.to_string()))?;
                return Ok(draft);
            }

            if cycle == MAX_REWRITE_CYCLES {
                let reasons: Vec<String> = offending
                    .iter()
                    .map(|(page, token)| format!("page {page}: {token}"))
                    .collect();
                let verdict = ModerationVerdict {
                    is_safe: false,
                    reasons: reasons.clone(),
                    suggestions: Vec::new(),
                };
                self.jobs
                    .record_moderation(
                        &job.id,
                        ModerationSide::Output,
                        verdict,
                        self.clock.now(),
                    )
                    .await
                    .map_err(|e| PipelineError::db_write(e.to_string()))?;
                return Err(PipelineError::safety_output(format!(
                    "output still unsafe after {MAX_REWRITE_CYCLES} rewrites: {}",
                    reasons.join("; ")
                )));
            }

            tracing::warn!(
                job_id = %job.id,
                cycle = cycle + 1,
                pages = ?offending.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
                "output moderation flagged pages, rewriting"
            );

            for (page_number, token) in offending {
                let feedback = format!("remove the unsafe content ({token}) from this page");
                let revised = self
                    .rewrite_page_text(spec, &draft, page_number, &feedback)
                    .await?;
                if let Some(page) = draft.page_mut(page_number) {
                    page.text = revised;
                }
            }
        }

        unreachable!("rewrite loop returns within the cycle budget");
    }

    async fn rewrite_page_text(
        &self,
        spec: &storyforge_core::BookSpec,
        draft: &StoryDraft,
        page_number: u32,
        feedback: &str,
    ) -> Result<String, PipelineError> {
        let request = prompts::rewrite_request(spec, draft, page_number, feedback);
        let response = tokio::time::timeout(
            self.config.llm_timeout,
            self.providers.llm.complete(&request),
        )
        .await
        .map_err(|_| PipelineError::new(ErrorCode::LlmTimeout, "rewrite deadline elapsed"))??;

        #[derive(serde::Deserialize)]
        struct Rewrite {
            revised_text: String,
        }
        let rewrite: Rewrite = parse_json_response(&response)?;
        Ok(rewrite.revised_text)
    }

    /// Stage H body: upload every image, then write the book and its pages.
    async fn package(
        &self,
        job: &Job,
        spec: &storyforge_core::BookSpec,
        book_id: BookId,
        draft: &StoryDraft,
        image_prompts: &ImagePrompts,
        image_bytes: std::collections::HashMap<u32, bytes::Bytes>,
    ) -> Result<(), PipelineError> {
        let cover_bytes = image_bytes
            .get(&storyforge_story::prompts::COVER_PAGE)
            .ok_or_else(|| PipelineError::new(ErrorCode::ImageFailed, "cover image missing"))?;
        let cover_url = self
            .providers
            .storage
            .put(
                &Book::cover_key(&book_id, IMAGE_EXT),
                cover_bytes.clone(),
                IMAGE_CONTENT_TYPE,
            )
            .await?;

        let mut pages = Vec::with_capacity(draft.pages.len());
        for page in &draft.pages {
            let bytes = image_bytes.get(&page.page).ok_or_else(|| {
                PipelineError::new(
                    ErrorCode::ImageFailed,
                    format!("image for page {} missing", page.page),
                )
            })?;
            let url = self
                .providers
                .storage
                .put(
                    &Book::page_key(&book_id, page.page, IMAGE_EXT),
                    bytes.clone(),
                    IMAGE_CONTENT_TYPE,
                )
                .await?;
            let prompt = image_prompts
                .page(page.page)
                .map(|p| p.positive_prompt.clone())
                .unwrap_or_default();
            pages.push(Page {
                page_number: page.page,
                text: page.text.clone(),
                image_url: url,
                image_prompt: prompt,
            });
        }

        let book = Book {
            id: book_id,
            job_id: job.id.clone(),
            title: draft.title.clone(),
            language: spec.language,
            target_age: spec.target_age,
            style: spec.style,
            theme: spec.theme.map(|t| t.as_str().to_string()),
            character_id: spec.character_id.clone(),
            character_ids: spec.character_ids.clone(),
            cover_image_url: cover_url,
            pages,
            user_key: job.user_key.clone(),
            created_at: self.clock.now(),
        };

        self.books
            .insert(book)
            .await
            .map_err(|e| PipelineError::db_write(e.to_string()))
    }

    /// Re-run the relevant sub-stage for a single page of a finished book.
    pub async fn regenerate_page(
        &self,
        job_id: &JobId,
        page_number: u32,
        target: RegenerateTarget,
        feedback: Option<String>,
    ) -> Result<(), PipelineError> {
        let book = self
            .books
            .get_by_job(job_id)
            .await
            .map_err(|e| PipelineError::db_write(e.to_string()))?
            .ok_or_else(|| PipelineError::new(ErrorCode::Unknown, "no book for job"))?;

        let draft = self
            .artifacts
            .load_draft(job_id)
            .await
            .map_err(|e| PipelineError::db_write(e.to_string()))?
            .ok_or_else(|| PipelineError::new(ErrorCode::Unknown, "no draft for job"))?;

        let spec = draft_spec(&book, &draft);

        tracing::info!(
            job_id = %job_id,
            book_id = %book.id,
            page = page_number,
            target = ?target,
            "regenerating page"
        );

        let mut new_text: Option<String> = None;
        if target.wants_text() {
            let feedback = feedback
                .unwrap_or_else(|| "improve this page while keeping the scene".to_string());
            let revised = self
                .rewrite_page_text(&spec, &draft, page_number, &feedback)
                .await?;
            policy::check_page_text(spec.target_age, &revised)
                .map_err(PipelineError::safety_output)?;
            new_text = Some(revised);
        }

        let mut new_image_url: Option<String> = None;
        if target.wants_image() {
            let prompts = self
                .artifacts
                .load_prompts(job_id)
                .await
                .map_err(|e| PipelineError::db_write(e.to_string()))?
                .ok_or_else(|| PipelineError::new(ErrorCode::Unknown, "no prompts for job"))?;
            let prompt = prompts.page(page_number).ok_or_else(|| {
                PipelineError::new(ErrorCode::Unknown, format!("no prompt for page {page_number}"))
            })?;

            let bytes = images::generate_single(
                self.providers.image.as_ref(),
                prompt,
                self.config.image_timeout,
                self.config.image_max_attempts,
                job_id,
            )
            .await?;
            let url = self
                .providers
                .storage
                .put(
                    &Book::page_key(&book.id, page_number, IMAGE_EXT),
                    bytes,
                    IMAGE_CONTENT_TYPE,
                )
                .await?;
            new_image_url = Some(url);
        }

        self.books
            .update_page(&book.id, page_number, new_text, new_image_url)
            .await
            .map_err(|e| PipelineError::db_write(e.to_string()))
    }
}

/// Reconstruct the spec-ish inputs regeneration needs from the stored book.
fn draft_spec(book: &Book, draft: &StoryDraft) -> storyforge_core::BookSpec {
    storyforge_core::BookSpec {
        topic: draft.title.clone(),
        language: book.language,
        target_age: book.target_age,
        style: book.style,
        page_count: book.pages.len() as u32,
        theme: None,
        character: None,
        character_id: book.character_id.clone(),
        character_ids: book.character_ids.clone(),
        forbidden_elements: Vec::new(),
    }
}
