//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (stores, providers, admission,
//!   orchestrator, monitor)
//! - `routes/`: HTTP routes + handlers (one file per domain area)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use storyforge_engine::EngineConfig;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub async fn build_app(config: EngineConfig) -> Router {
    let services = Arc::new(services::build_services(config).await);
    build_app_with(services)
}

/// Router over pre-built services (tests inject their own wiring).
pub fn build_app_with(services: Arc<services::AppServices>) -> Router {
    // Protected routes: require a user key.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn(middleware::user_key_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/health/detailed", get(routes::system::detailed_health))
        .layer(Extension(services))
        .merge(protected)
        .layer(ServiceBuilder::new())
}
