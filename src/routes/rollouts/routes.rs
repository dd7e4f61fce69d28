use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use super::PromoteRequest;
use crate::error::FlagError;
use crate::routes::middleware_auth::Actor;
use crate::state::AppState;

/// Promote a value through the listed environments; the deployment gate of the pipeline
pub async fn promote(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(key): Path<String>,
    Json(payload): Json<PromoteRequest>,
) -> Result<impl IntoResponse, FlagError> {
    let record = state
        .rollouts
        .promote(
            &key,
            payload.value,
            payload.environments,
            payload.policy,
            &actor,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// Rollout history of a flag, newest first
pub async fn list(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, FlagError> {
    let records = state.store.list_rollouts(&key).await?;
    Ok(Json(records))
}

pub async fn get(
    State(state): State<AppState>,
    Path(rollout_id): Path<Uuid>,
) -> Result<impl IntoResponse, FlagError> {
    let record = state.store.get_rollout(rollout_id).await?;
    Ok(Json(record))
}

pub async fn abort(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(rollout_id): Path<Uuid>,
) -> Result<impl IntoResponse, FlagError> {
    let status = state.rollouts.abort(rollout_id, &actor).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}
