use axum::Router;

pub mod books;
pub mod characters;
pub mod credits;
pub mod system;

/// Router for all user-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/v1/books", books::router())
        .nest("/v1/credits", credits::router())
        .nest("/v1/characters", characters::router())
        .nest("/v1/library", books::library_router())
}
