use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use storyforge_credits::CreditLedger as _;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::middleware::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(get_credits))
        .route("/transactions", get(get_transactions))
}

pub async fn get_credits(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Response {
    match services.ledger.balance(user.user_key()).await {
        Ok(balance) => (StatusCode::OK, Json(dto::CreditsResponse { balance })).into_response(),
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "ledger_error", e.to_string()),
    }
}

pub async fn get_transactions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Response {
    match services.ledger.transactions(user.user_key(), 50).await {
        Ok(transactions) => (
            StatusCode::OK,
            Json(serde_json::json!({ "transactions": transactions })),
        )
            .into_response(),
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "ledger_error", e.to_string()),
    }
}
