use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::AppState;

/// Checks `X-SDK-Key` when an SDK key is configured; open otherwise.
pub async fn require_sdk_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, impl IntoResponse> {
    let Some(expected) = state.sdk_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let sdk_key = req
        .headers()
        .get("x-sdk-key")
        .and_then(|v| v.to_str().ok());

    match sdk_key {
        Some(key) if key == expected => Ok(next.run(req).await),
        Some(_) => Err((StatusCode::UNAUTHORIZED, "Invalid SDK key")),
        None => Err((StatusCode::UNAUTHORIZED, "Missing X-SDK-Key header")),
    }
}
