use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use storyforge_core::CharacterId;
use storyforge_engine::characters::CharacterStore as _;
use storyforge_story::{Character, CharacterSheet};

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::middleware::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_character).get(list_characters))
        .route("/:character_id", get(get_character))
}

pub async fn create_character(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<dto::CreateCharacterRequest>,
) -> axum::response::Response {
    let sheet = CharacterSheet {
        name: body.name,
        master_description: body.master_description,
        appearance: body.appearance,
        clothing: body.clothing,
        personality_traits: body.personality_traits,
        visual_style_notes: body.visual_style_notes,
    };
    if let Err(e) = sheet.validate() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string());
    }

    let character = Character {
        id: CharacterId::new(),
        user_key: user.user_key().clone(),
        sheet,
        created_at: Utc::now(),
    };

    match services.characters.insert(character.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(character)).into_response(),
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}

pub async fn list_characters(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
) -> axum::response::Response {
    match services.characters.list_for_user(user.user_key()).await {
        Ok(characters) => {
            let total = characters.len();
            (
                StatusCode::OK,
                Json(serde_json::json!({ "characters": characters, "total": total })),
            )
                .into_response()
        }
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}

pub async fn get_character(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(character_id): Path<String>,
) -> axum::response::Response {
    let id: CharacterId = match character_id.parse() {
        Ok(id) => id,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "bad character id")
        }
    };

    match services.characters.get(&id).await {
        Ok(Some(character)) if &character.user_key == user.user_key() => {
            (StatusCode::OK, Json(character)).into_response()
        }
        Ok(Some(_)) => errors::json_error(StatusCode::FORBIDDEN, "forbidden", "access denied"),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "character not found"),
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}
