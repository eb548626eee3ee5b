use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use storyforge_engine::{AdmissionError, ErrorCode, PipelineError};

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn admission_error_to_response(err: AdmissionError) -> axum::response::Response {
    match err {
        AdmissionError::InvalidSpec(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        AdmissionError::RateLimited { retry_after } => (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(json!({
                "error": "rate_limit_exceeded",
                "message": "request limit reached, try again later",
                "retry_after": retry_after.as_secs(),
            })),
        )
            .into_response(),
        AdmissionError::DailyLimit { limit, used } => (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(json!({
                "error": "daily_limit_exceeded",
                "message": "daily generation limit reached, try again tomorrow",
                "limit": limit,
                "used": used,
            })),
        )
            .into_response(),
        AdmissionError::Overloaded => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({
                "error": "system_overloaded",
                "message": "too many jobs in flight, try again later",
                "retry_after": 60,
            })),
        )
            .into_response(),
        AdmissionError::NoCredits => json_error(
            StatusCode::PAYMENT_REQUIRED,
            "no_credits",
            "not enough credits to create a book",
        ),
        AdmissionError::QueueFailed => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "queue_failed",
            "failed to enqueue the job",
        ),
        AdmissionError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    let status = match err.code {
        ErrorCode::SafetyInput | ErrorCode::SafetyOutput => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Unknown => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, err.code.as_str(), err.message)
}
