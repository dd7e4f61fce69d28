use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use std::collections::BTreeMap;

use super::{EvaluateRequest, EvaluateResponse};
use crate::error::FlagError;
use crate::evaluation::{env_var_name, EvaluationContext};
use crate::state::AppState;
use crate::store::validate_environment_key;

/// Evaluate flags for a runtime context
///
/// Requested flags that are unknown or cannot be resolved are left out of the
/// response; the caller falls back to its own default for those.
pub async fn evaluate(
    State(state): State<AppState>,
    Json(request): Json<EvaluateRequest>,
) -> Result<impl IntoResponse, FlagError> {
    let context = request.context;
    validate_environment_key(&context.environment).map_err(FlagError::Validation)?;

    let mut flags = BTreeMap::new();
    match request.flags {
        Some(keys) => {
            for key in keys {
                match state.resolver.evaluate(&key, &context).await {
                    Ok(evaluation) => {
                        flags.insert(key, evaluation);
                    }
                    Err(e) => {
                        tracing::debug!(flag = %key, error = %e, "flag left out of evaluation");
                    }
                }
            }
        }
        None => {
            flags.extend(state.resolver.evaluate_all(&context).await?);
        }
    }

    Ok(Json(EvaluateResponse {
        environment: context.environment,
        flags,
    }))
}

/// Resolved values of every flag as container environment variables,
/// read by the provisioning layer once per apply
pub async fn export(
    State(state): State<AppState>,
    Path(environment): Path<String>,
) -> Result<impl IntoResponse, FlagError> {
    validate_environment_key(&environment).map_err(FlagError::Validation)?;

    let context = EvaluationContext::new(environment.as_str());
    let evaluations = state.resolver.evaluate_all(&context).await?;

    let variables: BTreeMap<String, String> = evaluations
        .into_iter()
        .map(|(key, evaluation)| (env_var_name(&key), evaluation.value.to_string()))
        .collect();

    tracing::info!(%environment, count = variables.len(), "flag values exported");
    Ok(Json(variables))
}
