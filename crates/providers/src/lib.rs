//! Capability ports consumed by the pipeline, with pluggable providers.
//!
//! Each external capability is a narrow trait (one method plus probes):
//! LLM completion, image generation, content moderation, object storage.
//! Provider-specific error shapes never leak past these traits; the stage
//! runner classifies the port-level error kinds into stable job error codes.

pub mod image;
pub mod llm;
pub mod mock;
pub mod moderation;
pub mod storage;

pub use image::{ImageClient, ImageError};
pub use llm::{parse_json_response, LlmClient, LlmError, LlmRequest};
pub use mock::{MockImageClient, MockLlmClient};
pub use moderation::{ContentModeration, LexiconModeration, LlmModeration, ModerationVerdict};
pub use storage::{InMemoryObjectStore, ObjectStore, StorageError};
