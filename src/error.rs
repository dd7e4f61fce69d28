use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::rollout::RolloutRecord;

#[derive(Debug, thiserror::Error)]
pub enum FlagError {
    #[error("flag '{0}' not found")]
    NotFound(String),

    #[error("rollout '{0}' not found")]
    RolloutNotFound(uuid::Uuid),

    #[error("flag '{0}' already exists")]
    AlreadyExists(String),

    #[error("flag '{0}' still has environment bindings")]
    FlagHasBindings(String),

    #[error("stale version for binding: expected {expected}, found {actual}")]
    Conflict { expected: i64, actual: i64 },

    #[error("a rollout is already in progress for flag '{0}'")]
    RolloutInProgress(String),

    #[error("health check failed in environment '{environment}', rollout rolled back")]
    HealthCheckFailed {
        environment: String,
        record: Box<RolloutRecord>,
    },

    #[error("rollout was aborted and rolled back")]
    RolloutAborted { record: Box<RolloutRecord> },

    #[error("{0}")]
    Validation(String),

    #[error("flag store unavailable: {0}")]
    StoreUnavailable(String),
}

impl FlagError {
    pub fn status(&self) -> StatusCode {
        match self {
            FlagError::NotFound(_) | FlagError::RolloutNotFound(_) => StatusCode::NOT_FOUND,
            FlagError::AlreadyExists(_)
            | FlagError::FlagHasBindings(_)
            | FlagError::Conflict { .. }
            | FlagError::RolloutInProgress(_)
            | FlagError::RolloutAborted { .. } => StatusCode::CONFLICT,
            FlagError::HealthCheckFailed { .. } => StatusCode::FAILED_DEPENDENCY,
            FlagError::Validation(_) => StatusCode::BAD_REQUEST,
            FlagError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<sqlx::Error> for FlagError {
    fn from(e: sqlx::Error) -> Self {
        FlagError::StoreUnavailable(e.to_string())
    }
}

impl IntoResponse for FlagError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = match &self {
            FlagError::HealthCheckFailed { record, .. } | FlagError::RolloutAborted { record } => {
                json!({ "error": self.to_string(), "rollout": record })
            }
            _ => json!({ "error": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} missing, it is required")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}
