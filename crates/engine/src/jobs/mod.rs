//! The job state machine and its durable store.
//!
//! ## Design
//!
//! - A job row is the only shared writable state for a job; orchestrator and
//!   monitor writes serialize on it
//! - Transitions that depend on prior state are compare-and-set against the
//!   observed `(status, updated_at)` so the monitor never clobbers a stage
//!   that just made progress
//! - Stored progress is monotone: writers propose a value and the store
//!   keeps the greater
//! - Jobs are never deleted (audit retention)

pub mod store;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{Job, JobState};

#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
