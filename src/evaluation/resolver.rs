use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{resolve, Evaluation, EvaluationContext, EvaluationReason};
use crate::error::FlagError;
use crate::store::{BindingLookup, Flag, FlagStore};

/// Request-time flag evaluation.
///
/// Keeps the last definition read for every flag so that a store outage
/// degrades to serving defaults instead of failing the caller.
#[derive(Clone)]
pub struct FlagResolver {
    store: Arc<dyn FlagStore>,
    definitions: Arc<RwLock<HashMap<String, Flag>>>,
    degraded: Arc<AtomicU64>,
}

impl FlagResolver {
    pub fn new(store: Arc<dyn FlagStore>) -> Self {
        Self {
            store,
            definitions: Arc::new(RwLock::new(HashMap::new())),
            degraded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Loads every definition into the cache. Called at startup.
    pub async fn warm(&self) -> Result<usize, FlagError> {
        let flags = self.store.list_flags().await?;
        let mut definitions = self.definitions.write().await;
        definitions.clear();
        for flag in flags {
            definitions.insert(flag.key.clone(), flag);
        }
        Ok(definitions.len())
    }

    /// Strict read of a definition, refreshing the cache. Errors propagate.
    pub async fn definition(&self, key: &str) -> Result<Flag, FlagError> {
        match self.store.get(key).await {
            Ok(flag) => {
                self.remember(&flag).await;
                Ok(flag)
            }
            Err(FlagError::NotFound(key)) => {
                self.forget(&key).await;
                Err(FlagError::NotFound(key))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn remember(&self, flag: &Flag) {
        self.definitions
            .write()
            .await
            .insert(flag.key.clone(), flag.clone());
    }

    pub async fn forget(&self, key: &str) {
        self.definitions.write().await.remove(key);
    }

    pub async fn evaluate(
        &self,
        key: &str,
        context: &EvaluationContext,
    ) -> Result<Evaluation, FlagError> {
        let flag = match self.definition(key).await {
            Ok(flag) => flag,
            Err(FlagError::StoreUnavailable(reason)) => {
                return self.degraded_evaluation(key, context, &reason).await;
            }
            Err(e) => return Err(e),
        };

        match self.store.get_binding(key, &context.environment).await {
            Ok(binding) => Ok(resolve(&flag, &binding)),
            Err(FlagError::StoreUnavailable(reason)) => {
                self.record_degraded(key, context, &reason);
                Ok(Evaluation {
                    value: flag.default_value,
                    reason: EvaluationReason::Degraded,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Serving-path check: never fails, anything but a bound or default `true` is off.
    pub async fn is_enabled(&self, key: &str, context: &EvaluationContext) -> bool {
        match self.evaluate(key, context).await {
            Ok(evaluation) => evaluation.value.as_bool().unwrap_or(false),
            Err(e) => {
                tracing::debug!(flag = key, error = %e, "flag evaluation failed, treating as off");
                false
            }
        }
    }

    /// Evaluates every flag for one environment with two store reads.
    pub async fn evaluate_all(
        &self,
        context: &EvaluationContext,
    ) -> Result<Vec<(String, Evaluation)>, FlagError> {
        let flags = match self.store.list_flags().await {
            Ok(flags) => flags,
            Err(FlagError::StoreUnavailable(reason)) => {
                let definitions = self.definitions.read().await;
                if definitions.is_empty() {
                    return Err(FlagError::StoreUnavailable(reason));
                }
                self.record_degraded("*", context, &reason);
                let mut results: Vec<(String, Evaluation)> = definitions
                    .values()
                    .map(|flag| {
                        (
                            flag.key.clone(),
                            Evaluation {
                                value: flag.default_value.clone(),
                                reason: EvaluationReason::Degraded,
                            },
                        )
                    })
                    .collect();
                results.sort_by(|a, b| a.0.cmp(&b.0));
                return Ok(results);
            }
            Err(e) => return Err(e),
        };

        {
            let mut definitions = self.definitions.write().await;
            definitions.clear();
            for flag in &flags {
                definitions.insert(flag.key.clone(), flag.clone());
            }
        }

        let bindings = match self.store.list_environment_bindings(&context.environment).await {
            Ok(bindings) => Some(bindings),
            Err(FlagError::StoreUnavailable(reason)) => {
                self.record_degraded("*", context, &reason);
                None
            }
            Err(e) => return Err(e),
        };

        let Some(bindings) = bindings else {
            return Ok(flags
                .into_iter()
                .map(|flag| {
                    let evaluation = Evaluation {
                        value: flag.default_value,
                        reason: EvaluationReason::Degraded,
                    };
                    (flag.key, evaluation)
                })
                .collect());
        };

        let mut by_flag: HashMap<String, BindingLookup> = bindings
            .into_iter()
            .map(|b| (b.flag_key.clone(), BindingLookup::Bound(b)))
            .collect();

        Ok(flags
            .into_iter()
            .map(|flag| {
                let binding = by_flag.remove(&flag.key).unwrap_or(BindingLookup::Default);
                let evaluation = resolve(&flag, &binding);
                (flag.key, evaluation)
            })
            .collect())
    }

    pub fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    async fn degraded_evaluation(
        &self,
        key: &str,
        context: &EvaluationContext,
        reason: &str,
    ) -> Result<Evaluation, FlagError> {
        let cached = self.definitions.read().await.get(key).cloned();
        match cached {
            Some(flag) => {
                self.record_degraded(key, context, reason);
                Ok(Evaluation {
                    value: flag.default_value,
                    reason: EvaluationReason::Degraded,
                })
            }
            None => Err(FlagError::StoreUnavailable(reason.to_string())),
        }
    }

    fn record_degraded(&self, key: &str, context: &EvaluationContext, reason: &str) {
        let total = self.degraded.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            flag = key,
            environment = %context.environment,
            degraded_total = total,
            reason,
            "flag store unavailable, serving default"
        );
    }
}
