use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthData {
    status: u16,
    store: &'static str,
    degraded_evaluations: u64,
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthData>) {
    let (status, store) = match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "up"),
        Err(e) => {
            tracing::warn!(error = %e, "health probe could not reach flag store");
            (StatusCode::SERVICE_UNAVAILABLE, "down")
        }
    };

    let health_data = HealthData {
        status: status.as_u16(),
        store,
        degraded_evaluations: state.resolver.degraded_count(),
    };
    (status, Json(health_data))
}
