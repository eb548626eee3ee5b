use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use storyforge_core::{BookSpec, JobId};
use storyforge_engine::library::BookStore as _;
use storyforge_engine::JobStore as _;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::middleware::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_book))
        .route("/:job_id", get(get_book_status))
        .route("/:job_id/pages/:page_number/regenerate", post(regenerate_page))
}

pub fn library_router() -> Router {
    Router::new().route("/", get(list_library))
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Create a new book generation job. Returns a job id to poll; one credit is
/// debited at admission.
pub async fn create_book(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    headers: HeaderMap,
    Json(spec): Json<BookSpec>,
) -> axum::response::Response {
    let outcome = match services
        .admission
        .create_job(user.user_key(), spec, idempotency_key(&headers))
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return errors::admission_error_to_response(e),
    };

    (
        StatusCode::ACCEPTED,
        Json(dto::CreateBookResponse {
            job_id: outcome.job_id,
            status: outcome.status,
            estimated_time_seconds: 120,
        }),
    )
        .into_response()
}

/// Job status; includes the packaged book once the job is done.
pub async fn get_book_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match job_id.parse() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "bad job id"),
    };

    let job = match services.jobs.get(&job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => {
            return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    };

    if &job.user_key != user.user_key() {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", "access denied");
    }

    let book = if job.status == storyforge_engine::JobState::Done {
        match services.books.get_by_job(&job_id).await {
            Ok(book) => book,
            Err(e) => {
                return errors::json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_error",
                    e.to_string(),
                )
            }
        }
    } else {
        None
    };

    (StatusCode::OK, Json(dto::JobStatusResponse::from_job(job, book))).into_response()
}

/// Re-run the text and/or image sub-stage for one page of a finished book.
pub async fn regenerate_page(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path((job_id, page_number)): Path<(String, u32)>,
    Json(body): Json<dto::RegeneratePageRequest>,
) -> axum::response::Response {
    let job_id: JobId = match job_id.parse() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "bad job id"),
    };

    // Ownership check through the job row.
    match services.jobs.get(&job_id).await {
        Ok(Some(job)) if &job.user_key == user.user_key() => {}
        Ok(Some(_)) => {
            return errors::json_error(StatusCode::FORBIDDEN, "forbidden", "access denied")
        }
        Ok(None) => return errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => {
            return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }

    if let Err(e) = services
        .orchestrator
        .regenerate_page(&job_id, page_number, body.target, body.feedback)
        .await
    {
        return errors::pipeline_error_to_response(e);
    }

    (
        StatusCode::OK,
        Json(dto::RegeneratePageResponse {
            job_id,
            page_number,
            target: body.target,
        }),
    )
        .into_response()
}

/// The caller's finished books, newest first.
pub async fn list_library(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Response {
    match services.books.list_for_user(user.user_key()).await {
        Ok(books) => {
            let total = books.len();
            (
                StatusCode::OK,
                Json(serde_json::json!({ "books": books, "total": total })),
            )
                .into_response()
        }
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}
