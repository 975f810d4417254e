use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::admin::ControlState;

/// Require `Authorization: Bearer <control.api_key>`.
///
/// The key is read from the live configuration, so a reload rotates it.
pub async fn admin_auth_middleware(
    State(state): State<Arc<ControlState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = format!("Bearer {}", state.config.current().control.api_key);

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|value| value == expected);

    if authorized {
        Ok(next.run(request).await)
    } else {
        tracing::warn!(path = %request.uri().path(), "Rejected control request");
        Err(StatusCode::UNAUTHORIZED)
    }
}
