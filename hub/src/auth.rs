use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::HubError;

/// Axum middleware: require `Authorization: Bearer <token>` on admin routes when
/// an admin token is configured.
///
/// When `REPLAY_ADMIN_TOKEN` is empty the middleware is a no-op.
pub async fn require_admin_token(request: Request, next: Next) -> Response {
    let token = request
        .extensions()
        .get::<AdminToken>()
        .map(|t| t.0.clone())
        .unwrap_or_default();

    // No token configured ⇒ allow all.
    if token.is_empty() {
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = format!("Bearer {token}");
    if constant_time_eq(auth_header.as_bytes(), expected.as_bytes()) {
        return next.run(request).await;
    }

    tracing::warn!(path = %request.uri().path(), "admin request rejected");
    HubError::Unauthorized.into_response()
}

/// Extension injected into every request so the middleware can read the token.
#[derive(Clone, Default)]
pub struct AdminToken(pub String);

/// Constant-time comparison to prevent timing attacks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
