//! Tracing for the generation pipeline.
//!
//! Orchestrator, stage runner, and monitor events carry `job_id`, `step`,
//! and `attempt` fields. The subscriber is configured so those fields land
//! flattened in the JSON output together with the enclosing job span, and
//! span closes are emitted so each job's wall-clock shows up without a
//! separate metrics layer.

use tracing::{info_span, Span};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// JSON lines, `RUST_LOG`-style filtering, one extra line per closed span
/// carrying its elapsed time. Safe to call multiple times (subsequent calls
/// are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Span wrapping one job's pipeline execution.
///
/// `step` and `attempt` are declared up front and start empty; the stage
/// runner records them as the pipeline advances, so every event inside the
/// span reports the stage it belongs to without re-stating the job id.
pub fn job_span(job_id: &str) -> Span {
    info_span!(
        "job",
        job_id,
        step = tracing::field::Empty,
        attempt = tracing::field::Empty,
    )
}
