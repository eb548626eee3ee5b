//! Observability: tracing/logging initialization and the job span.

mod tracing_init;

pub use tracing_init::{init, job_span};
