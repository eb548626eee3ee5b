#[tokio::main]
async fn main() {
    storyforge_observability::init();

    let config = storyforge_engine::EngineConfig::from_env();
    let app = storyforge_api::app::build_app(config).await;

    let addr = std::env::var("STORYFORGE_LISTEN").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}
