mod config;
mod error;
mod evaluation;
mod rollout;
mod routes;
mod state;
mod store;

use sqlx::PgPool;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{Config, LogFormat, StoreBackend};
use rollout::SignalHealthChecker;
use store::{FlagStore, MemoryFlagStore, PgFlagStore};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn connect_store(config: &Config) -> Result<Arc<dyn FlagStore>, Box<dyn std::error::Error>> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or("DATABASE_URL missing, it is required")?;
            let db = PgPool::connect(url).await?;
            let store = PgFlagStore::new(db);
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory flag store, state is lost on restart");
            Ok(Arc::new(MemoryFlagStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    let store = connect_store(&config).await?;
    let health_signals = Arc::new(SignalHealthChecker::new(config.health_signal_ttl_secs));
    let state = state::AppState::new(
        store,
        health_signals,
        &config.jwt_secret,
        config.sdk_key.as_deref(),
    );

    match state.resolver.warm().await {
        Ok(count) => tracing::info!(flags = count, "flag definitions loaded"),
        Err(e) => tracing::warn!(error = %e, "could not preload flag definitions"),
    }

    let app = routes::routes(state);

    let listener = tokio::net::TcpListener::bind(config.addr()).await?;

    tracing::info!(addr = %config.addr(), "flag service listening");

    axum::serve(listener, app).await?;
    Ok(())
}
