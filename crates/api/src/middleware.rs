use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use storyforge_core::UserKey;

/// Per-request user identity, extracted from `X-User-Key`.
#[derive(Debug, Clone)]
pub struct UserContext {
    user_key: UserKey,
}

impl UserContext {
    pub fn user_key(&self) -> &UserKey {
        &self.user_key
    }
}

/// Require a valid `X-User-Key` header on every protected route. The key is
/// opaque here; real authentication belongs to the request tier in front of
/// this service.
pub async fn user_key_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let user_key = extract_user_key(req.headers())?;
    req.extensions_mut().insert(UserContext { user_key });
    Ok(next.run(req).await)
}

fn extract_user_key(headers: &HeaderMap) -> Result<UserKey, StatusCode> {
    let header = headers
        .get("x-user-key")
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_str()
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    UserKey::new(header.trim()).map_err(|_| StatusCode::UNAUTHORIZED)
}
