use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;

use super::{BindingResponse, HealthSignalRequest, SetBindingRequest};
use crate::error::FlagError;
use crate::rollout::health::HealthSignal;
use crate::routes::middleware_auth::Actor;
use crate::state::AppState;
use crate::store::validate_environment_key;

/// List the explicit bindings of a flag
pub async fn list(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, FlagError> {
    let bindings = state.store.list_bindings(&key).await?;
    let response: Vec<BindingResponse> = bindings
        .into_iter()
        .map(BindingResponse::from)
        .collect();
    Ok(Json(response))
}

/// Get the binding of one environment, or the default it falls back to
pub async fn get(
    State(state): State<AppState>,
    Path((key, environment)): Path<(String, String)>,
) -> Result<impl IntoResponse, FlagError> {
    validate_environment_key(&environment).map_err(FlagError::Validation)?;

    let flag = state.store.get(&key).await?;
    let lookup = state.store.get_binding(&key, &environment).await?;
    Ok(Json(BindingResponse::from_lookup(&flag, &environment, lookup)))
}

/// Check-and-set write of one environment's value
pub async fn set(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path((key, environment)): Path<(String, String)>,
    Json(payload): Json<SetBindingRequest>,
) -> Result<impl IntoResponse, FlagError> {
    validate_environment_key(&environment).map_err(FlagError::Validation)?;

    let binding = state
        .store
        .set_binding(
            &key,
            &environment,
            payload.value,
            &actor,
            payload.expected_version,
        )
        .await?;

    tracing::info!(
        flag = %key,
        %environment,
        value = %binding.value,
        version = binding.version,
        %actor,
        "binding set"
    );

    Ok(Json(BindingResponse::from(binding)))
}

/// Record the latest health signal for an environment
pub async fn report_health(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(environment): Path<String>,
    Json(payload): Json<HealthSignalRequest>,
) -> Result<impl IntoResponse, FlagError> {
    validate_environment_key(&environment).map_err(FlagError::Validation)?;

    let signal = HealthSignal {
        environment,
        status: payload.status,
        detail: payload.detail,
        reported_by: actor,
        reported_at: Utc::now(),
    };
    state.health_signals.report(signal.clone()).await;
    Ok(Json(signal))
}
