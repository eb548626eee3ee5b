use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::errors;
use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Job metrics, provider wiring, and the effective guardrail configuration.
pub async fn detailed_health(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let jobs = match services.monitor.metrics().await {
        Ok(metrics) => metrics,
        Err(e) => {
            return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    };

    let config = &services.config;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "jobs": jobs,
            "services": {
                "llm": services.llm_provider,
                "image": services.image_provider,
                "storage": services.storage_backend,
            },
            "config": {
                "sla_seconds": config.sla.as_secs(),
                "stuck_timeout_seconds": config.stuck_timeout.as_secs(),
                "monitor_interval_seconds": config.monitor_interval.as_secs(),
                "image_max_concurrent": config.image_max_concurrent,
                "daily_job_limit_per_user": config.daily_job_limit_per_user,
                "max_pending_jobs": config.max_pending_jobs,
                "rate_limit_requests": config.rate_limit_requests,
                "rate_limit_window_seconds": config.rate_limit_window.as_secs(),
            },
        })),
    )
        .into_response()
}
