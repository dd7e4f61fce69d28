use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use super::FlagResponse;
use crate::error::FlagError;
use crate::routes::middleware_auth::Actor;
use crate::state::AppState;
use crate::store::{FlagUpdate, NewFlag};

/// Create a new feature flag
pub async fn create(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(payload): Json<NewFlag>,
) -> Result<impl IntoResponse, FlagError> {
    payload.validate()?;

    let flag = state.store.create_flag(payload).await?;
    state.resolver.remember(&flag).await;

    tracing::info!(flag = %flag.key, kind = flag.kind.as_str(), %actor, "flag created");
    Ok((StatusCode::CREATED, Json(FlagResponse::from(flag))))
}

/// List all flags
pub async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, FlagError> {
    let flags = state.store.list_flags().await?;
    let response: Vec<FlagResponse> = flags.into_iter().map(FlagResponse::from).collect();
    Ok(Json(response))
}

/// Get a single flag by key
pub async fn get(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, FlagError> {
    let flag = state.resolver.definition(&key).await?;
    Ok(Json(FlagResponse::from(flag)))
}

/// Update description or default value; key and kind never change
pub async fn update(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(key): Path<String>,
    Json(payload): Json<FlagUpdate>,
) -> Result<impl IntoResponse, FlagError> {
    let flag = state.store.update_flag(&key, payload).await?;
    state.resolver.remember(&flag).await;

    tracing::info!(flag = %flag.key, default = %flag.default_value, %actor, "flag updated");
    Ok(Json(FlagResponse::from(flag)))
}

/// Delete a flag that no environment binds any more
pub async fn delete(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, FlagError> {
    state.store.delete_flag(&key).await?;
    state.resolver.forget(&key).await;

    tracing::info!(flag = %key, %actor, "flag deleted");
    Ok(StatusCode::NO_CONTENT)
}
