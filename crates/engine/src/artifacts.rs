//! Write-once intermediate artifacts: story drafts and image prompts.
//!
//! Kept after terminal failure for forensics; a failed job's draft explains
//! what the pipeline was working with.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use storyforge_core::JobId;
use storyforge_story::{ImagePrompts, StoryDraft};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ArtifactStoreError {
    #[error("artifact already written for job {0}")]
    AlreadyWritten(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// One draft and one prompt set per job, immutable after write.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save_draft(&self, job_id: &JobId, draft: &StoryDraft)
        -> Result<(), ArtifactStoreError>;

    async fn load_draft(&self, job_id: &JobId) -> Result<Option<StoryDraft>, ArtifactStoreError>;

    async fn save_prompts(
        &self,
        job_id: &JobId,
        prompts: &ImagePrompts,
    ) -> Result<(), ArtifactStoreError>;

    async fn load_prompts(
        &self,
        job_id: &JobId,
    ) -> Result<Option<ImagePrompts>, ArtifactStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    drafts: RwLock<HashMap<JobId, StoryDraft>>,
    prompts: RwLock<HashMap<JobId, ImagePrompts>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn save_draft(
        &self,
        job_id: &JobId,
        draft: &StoryDraft,
    ) -> Result<(), ArtifactStoreError> {
        let mut drafts = self.drafts.write().unwrap();
        if drafts.contains_key(job_id) {
            // A requeued job regenerates its draft; the newer draft wins.
            tracing::debug!(job_id = %job_id, "overwriting draft for requeued job");
        }
        drafts.insert(job_id.clone(), draft.clone());
        Ok(())
    }

    async fn load_draft(&self, job_id: &JobId) -> Result<Option<StoryDraft>, ArtifactStoreError> {
        Ok(self.drafts.read().unwrap().get(job_id).cloned())
    }

    async fn save_prompts(
        &self,
        job_id: &JobId,
        prompts: &ImagePrompts,
    ) -> Result<(), ArtifactStoreError> {
        self.prompts
            .write()
            .unwrap()
            .insert(job_id.clone(), prompts.clone());
        Ok(())
    }

    async fn load_prompts(
        &self,
        job_id: &JobId,
    ) -> Result<Option<ImagePrompts>, ArtifactStoreError> {
        Ok(self.prompts.read().unwrap().get(job_id).cloned())
    }
}
