//! Hand-off from admission (and the monitor) to the pipeline.
//!
//! The dispatcher is backend-agnostic: the in-process implementation spawns
//! the pipeline task directly; a durable task queue satisfies the same trait
//! when a deployment needs work to survive process restarts.

use std::sync::Arc;

use async_trait::async_trait;

use storyforge_core::JobId;

use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to enqueue job: {0}")]
pub struct DispatchError(pub String);

/// Enqueue a queued job for pipeline execution.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job_id: JobId) -> Result<(), DispatchError>;
}

/// In-process dispatcher: one tokio task per job.
pub struct TokioDispatcher {
    orchestrator: Arc<Orchestrator>,
}

impl TokioDispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobDispatcher for TokioDispatcher {
    async fn dispatch(&self, job_id: JobId) -> Result<(), DispatchError> {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.run_job(job_id).await;
        });
        Ok(())
    }
}

/// Test dispatcher that records dispatched ids without running anything.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    dispatched: std::sync::Mutex<Vec<JobId>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) -> Vec<JobId> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn dispatch(&self, job_id: JobId) -> Result<(), DispatchError> {
        self.dispatched.lock().unwrap().push(job_id);
        Ok(())
    }
}
