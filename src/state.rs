use std::sync::Arc;

use crate::evaluation::FlagResolver;
use crate::rollout::{RolloutController, SignalHealthChecker};
use crate::store::FlagStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FlagStore>,
    pub resolver: FlagResolver,
    pub rollouts: Arc<RolloutController>,
    pub health_signals: Arc<SignalHealthChecker>,
    pub jwt_secret: Arc<str>,
    pub sdk_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn FlagStore>,
        health_signals: Arc<SignalHealthChecker>,
        jwt_secret: &str,
        sdk_key: Option<&str>,
    ) -> Self {
        let resolver = FlagResolver::new(store.clone());
        let rollouts = Arc::new(RolloutController::new(
            store.clone(),
            resolver.clone(),
            health_signals.clone(),
        ));

        Self {
            store,
            resolver,
            rollouts,
            health_signals,
            jwt_secret: Arc::from(jwt_secret),
            sdk_key: sdk_key.map(Arc::from),
        }
    }
}
