use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

mod environments;
mod flags;
mod health;
mod middleware_auth;
mod rollouts;
mod sdk;
mod sdk_auth;

pub use health::health;

use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    let flag_router = Router::new()
        .route("/", post(flags::routes::create).get(flags::routes::list))
        .route(
            "/{key}",
            get(flags::routes::get)
                .put(flags::routes::update)
                .delete(flags::routes::delete),
        )
        .route("/{key}/environments", get(environments::routes::list))
        .route(
            "/{key}/environments/{environment}",
            get(environments::routes::get).put(environments::routes::set),
        )
        .route(
            "/{key}/rollouts",
            post(rollouts::routes::promote).get(rollouts::routes::list),
        );

    let rollout_router = Router::new()
        .route("/{id}", get(rollouts::routes::get))
        .route("/{id}/abort", post(rollouts::routes::abort));

    let sdk_router = Router::new()
        .route("/evaluate", post(sdk::routes::evaluate))
        .route(
            "/environments/{environment}/export",
            get(sdk::routes::export),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            sdk_auth::require_sdk_key,
        ));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest(
            "/api",
            Router::new()
                .nest("/flags", flag_router)
                .nest("/rollouts", rollout_router)
                .route(
                    "/environments/{environment}/health",
                    put(environments::routes::report_health),
                )
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    middleware_auth::require_auth,
                )),
        )
        .nest("/sdk", sdk_router)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> &'static str {
    "Flag rollout service"
}
