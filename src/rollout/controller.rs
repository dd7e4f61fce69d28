use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use super::{
    HealthChecker, HealthStatus, RolloutPolicy, RolloutRecord, RolloutState, RolloutTransition,
    StepOutcome,
};
use crate::error::FlagError;
use crate::evaluation::{EvaluationContext, EvaluationReason, FlagResolver};
use crate::store::{validate_environment_key, FlagStore, FlagValue};

type Registry = Arc<Mutex<HashMap<Uuid, watch::Sender<bool>>>>;

/// Promotes flag values environment by environment.
///
/// State per rollout: `Pending -> Applying(env) -> Applied(env) -> ... -> Completed`,
/// or `RolledBack` when a health gate fails, the operator aborts or a write fails.
/// The store admits one active rollout per flag.
pub struct RolloutController {
    store: Arc<dyn FlagStore>,
    resolver: FlagResolver,
    health: Arc<dyn HealthChecker>,
    in_flight: Registry,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AbortStatus {
    /// The running rollout was signalled and is rolling back.
    Signalled { rollout_id: Uuid },
    /// No running controller owned the rollout; it was closed as rolled back.
    Recovered { record: RolloutRecord },
}

struct AppliedStep {
    environment: String,
    previous: Option<FlagValue>,
    written_version: i64,
}

enum Halt {
    Unhealthy(String),
    Aborted,
    Failed(FlagError),
}

/// Removes the rollout's abort handle on every exit path.
struct InFlight {
    registry: Registry,
    id: Uuid,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.id);
    }
}

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<Uuid, watch::Sender<bool>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once abort has been signalled.
async fn aborted(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // sender gone, nobody can abort any more
            std::future::pending::<()>().await;
        }
    }
}

pub fn validate_environments(environments: &[String]) -> Result<(), FlagError> {
    if environments.is_empty() {
        return Err(FlagError::Validation(
            "At least one environment is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for environment in environments {
        validate_environment_key(environment).map_err(FlagError::Validation)?;
        if !seen.insert(environment.as_str()) {
            return Err(FlagError::Validation(format!(
                "Environment '{}' is listed twice",
                environment
            )));
        }
    }
    Ok(())
}

impl RolloutController {
    pub fn new(
        store: Arc<dyn FlagStore>,
        resolver: FlagResolver,
        health: Arc<dyn HealthChecker>,
    ) -> Self {
        Self {
            store,
            resolver,
            health,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn promote(
        &self,
        key: &str,
        value: FlagValue,
        environments: Vec<String>,
        policy: RolloutPolicy,
        actor: &str,
    ) -> Result<RolloutRecord, FlagError> {
        validate_environments(&environments)?;
        let flag = self.resolver.definition(key).await?;
        flag.check_value(&value)?;

        let mut record = RolloutRecord::new(key, value, environments, policy, actor);
        self.store.begin_rollout(&record).await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        lock(&self.in_flight).insert(record.id, cancel_tx);
        let _in_flight = InFlight {
            registry: self.in_flight.clone(),
            id: record.id,
        };

        tracing::info!(
            rollout_id = %record.id,
            flag = key,
            value = %record.value,
            environments = ?record.environments,
            actor,
            "rollout started"
        );

        let mut applied = Vec::new();
        if let Err(halt) = self.run(&mut record, &mut applied, cancel_rx).await {
            return Err(self.roll_back(record, applied, halt).await);
        }

        let now = Utc::now();
        match self
            .store
            .finish_rollout(record.id, RolloutState::Completed, now)
            .await
        {
            Ok(true) => {
                record.finish(RolloutState::Completed, now);
                tracing::info!(rollout_id = %record.id, flag = key, "rollout completed");
                Ok(record)
            }
            // closed by an abort on another replica after the last checkpoint
            Ok(false) => Err(self.roll_back(record, applied, Halt::Aborted).await),
            Err(e) => Err(self.roll_back(record, applied, Halt::Failed(e)).await),
        }
    }

    /// Signals a running rollout, or closes one whose process is gone.
    pub async fn abort(&self, rollout_id: Uuid, actor: &str) -> Result<AbortStatus, FlagError> {
        let signalled = match lock(&self.in_flight).get(&rollout_id) {
            Some(cancel) => {
                let _ = cancel.send(true);
                true
            }
            None => false,
        };

        if signalled {
            tracing::info!(%rollout_id, actor, "rollout abort signalled");
            return Ok(AbortStatus::Signalled { rollout_id });
        }

        let mut record = self.store.get_rollout(rollout_id).await?;
        if record.state.is_terminal() {
            return Err(FlagError::Validation(format!(
                "Rollout {} already finished as {}",
                rollout_id,
                record.state.as_str()
            )));
        }

        let now = Utc::now();
        let closed = self
            .store
            .finish_rollout(rollout_id, RolloutState::RolledBack, now)
            .await?;
        if !closed {
            return Err(FlagError::Validation(format!(
                "Rollout {} finished while being aborted",
                rollout_id
            )));
        }
        record.finish(RolloutState::RolledBack, now);

        // a runner still alive elsewhere sees the closed record at its next
        // checkpoint and reverts what it applied
        tracing::warn!(
            %rollout_id,
            flag = %record.flag_key,
            actor,
            "rollout closed without a local owner"
        );
        Ok(AbortStatus::Recovered { record })
    }

    async fn run(
        &self,
        record: &mut RolloutRecord,
        applied: &mut Vec<AppliedStep>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), Halt> {
        let environments = record.environments.clone();

        for (i, environment) in environments.iter().enumerate() {
            if i > 0 {
                self.gate(record, &environments[i - 1], &mut cancel).await?;
            }
            self.checkpoint(record, &cancel).await?;
            self.apply(record, environment, applied)
                .await
                .map_err(Halt::Failed)?;
        }

        self.checkpoint(record, &cancel).await
    }

    /// Stops on a local abort signal or when the stored record was closed
    /// by another replica.
    async fn checkpoint(
        &self,
        record: &RolloutRecord,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), Halt> {
        if *cancel.borrow() {
            return Err(Halt::Aborted);
        }

        let stored = self
            .store
            .get_rollout(record.id)
            .await
            .map_err(Halt::Failed)?;
        if stored.state.is_terminal() {
            tracing::warn!(
                rollout_id = %record.id,
                state = stored.state.as_str(),
                "rollout closed elsewhere, stopping"
            );
            return Err(Halt::Aborted);
        }
        Ok(())
    }

    /// Soak, then health check of the environment just applied.
    async fn gate(
        &self,
        record: &RolloutRecord,
        environment: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), Halt> {
        if record.policy.soak_secs > 0 {
            tracing::debug!(
                rollout_id = %record.id,
                environment,
                soak_secs = record.policy.soak_secs,
                "soaking"
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(record.policy.soak_secs)) => {}
                _ = aborted(cancel) => return Err(Halt::Aborted),
            }
        }

        if *cancel.borrow() {
            return Err(Halt::Aborted);
        }

        if record.policy.require_health_check {
            match self.health.check(environment).await {
                HealthStatus::Healthy => {
                    tracing::debug!(rollout_id = %record.id, environment, "health check passed");
                }
                HealthStatus::Unhealthy => return Err(Halt::Unhealthy(environment.to_string())),
            }
        }

        Ok(())
    }

    async fn apply(
        &self,
        record: &mut RolloutRecord,
        environment: &str,
        applied: &mut Vec<AppliedStep>,
    ) -> Result<(), FlagError> {
        let current = self.store.get_binding(&record.flag_key, environment).await?;
        let previous = current.value().cloned();

        self.append(
            record,
            RolloutTransition::new(environment, StepOutcome::Pending, previous.clone()),
        )
        .await?;

        let written = match self
            .store
            .set_binding(
                &record.flag_key,
                environment,
                record.value.clone(),
                &record.actor,
                current.version(),
            )
            .await
        {
            Ok(binding) => binding,
            Err(e) => {
                let transition =
                    RolloutTransition::new(environment, StepOutcome::RolledBack, previous)
                        .with_note(format!("not applied: {e}"));
                if let Err(append_err) = self.append(record, transition).await {
                    tracing::warn!(
                        rollout_id = %record.id,
                        error = %append_err,
                        "could not record failed step"
                    );
                }
                return Err(e);
            }
        };

        applied.push(AppliedStep {
            environment: environment.to_string(),
            previous: previous.clone(),
            written_version: written.version,
        });

        self.append(
            record,
            RolloutTransition::new(environment, StepOutcome::Applied, previous),
        )
        .await?;

        // read back through the resolver: the service must now see our write
        let effective = self
            .resolver
            .evaluate(&record.flag_key, &EvaluationContext::new(environment))
            .await?;
        match effective.reason {
            EvaluationReason::Binding { version } if version == written.version => {}
            EvaluationReason::Binding { version } => {
                return Err(FlagError::Conflict {
                    expected: written.version,
                    actual: version,
                })
            }
            EvaluationReason::Default => {
                return Err(FlagError::Conflict {
                    expected: written.version,
                    actual: 0,
                })
            }
            EvaluationReason::Degraded => {
                return Err(FlagError::StoreUnavailable(format!(
                    "could not confirm '{}' in {}",
                    record.flag_key, environment
                )))
            }
        }

        tracing::info!(
            rollout_id = %record.id,
            flag = %record.flag_key,
            environment,
            version = written.version,
            "environment applied"
        );
        Ok(())
    }

    /// Reverts the most recent environment, then keeps reverting while the new
    /// value still holds a majority of the requested environments.
    async fn roll_back(
        &self,
        mut record: RolloutRecord,
        mut applied: Vec<AppliedStep>,
        halt: Halt,
    ) -> FlagError {
        let reason = match &halt {
            Halt::Unhealthy(environment) => format!("health check failed in {environment}"),
            Halt::Aborted => "aborted by operator".to_string(),
            Halt::Failed(e) => e.to_string(),
        };
        tracing::warn!(rollout_id = %record.id, flag = %record.flag_key, %reason, "rolling back");

        let total = record.environments.len();
        if let Some(step) = applied.pop() {
            self.revert(&mut record, &step, &reason).await;
        }
        while applied.len() * 2 > total {
            let Some(step) = applied.pop() else { break };
            self.revert(&mut record, &step, "majority still on new value").await;
        }

        let now = Utc::now();
        match self
            .store
            .finish_rollout(record.id, RolloutState::RolledBack, now)
            .await
        {
            Ok(_) => {}
            Err(e) => tracing::error!(
                rollout_id = %record.id,
                error = %e,
                "could not close rolled back rollout"
            ),
        }
        record.finish(RolloutState::RolledBack, now);

        match halt {
            Halt::Unhealthy(environment) => FlagError::HealthCheckFailed {
                environment,
                record: Box::new(record),
            },
            Halt::Aborted => FlagError::RolloutAborted {
                record: Box::new(record),
            },
            Halt::Failed(e) => e,
        }
    }

    async fn revert(&self, record: &mut RolloutRecord, step: &AppliedStep, reason: &str) {
        let result = match &step.previous {
            Some(previous) => self
                .store
                .set_binding(
                    &record.flag_key,
                    &step.environment,
                    previous.clone(),
                    &record.actor,
                    step.written_version,
                )
                .await
                .map(|_| ()),
            None => {
                self.store
                    .clear_binding(&record.flag_key, &step.environment, step.written_version)
                    .await
            }
        };

        let transition = RolloutTransition::new(
            &step.environment,
            StepOutcome::RolledBack,
            step.previous.clone(),
        );
        let transition = match result {
            Ok(()) => {
                tracing::info!(
                    rollout_id = %record.id,
                    environment = %step.environment,
                    "environment reverted"
                );
                transition.with_note(reason)
            }
            Err(e) => {
                tracing::error!(
                    rollout_id = %record.id,
                    environment = %step.environment,
                    error = %e,
                    "revert failed, manual intervention required"
                );
                transition.with_note(format!("revert failed: {e}"))
            }
        };

        if let Err(e) = self.append(record, transition).await {
            tracing::error!(rollout_id = %record.id, error = %e, "could not record revert");
        }
    }

    async fn append(
        &self,
        record: &mut RolloutRecord,
        transition: RolloutTransition,
    ) -> Result<(), FlagError> {
        self.store.append_transition(record.id, &transition).await?;
        record.push(transition);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        BindingLookup, EnvironmentBinding, Flag, FlagKind, FlagUpdate, MemoryFlagStore, NewFlag,
    };
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct AlwaysHealthy;

    #[async_trait::async_trait]
    impl HealthChecker for AlwaysHealthy {
        async fn check(&self, _environment: &str) -> HealthStatus {
            HealthStatus::Healthy
        }
    }

    struct ScriptedHealth(HashMap<String, HealthStatus>);

    #[async_trait::async_trait]
    impl HealthChecker for ScriptedHealth {
        async fn check(&self, environment: &str) -> HealthStatus {
            self.0
                .get(environment)
                .copied()
                .unwrap_or(HealthStatus::Healthy)
        }
    }

    /// Blocks inside `check` until released.
    #[derive(Default)]
    struct GatedHealth {
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl HealthChecker for GatedHealth {
        async fn check(&self, _environment: &str) -> HealthStatus {
            self.entered.notify_one();
            self.release.notified().await;
            HealthStatus::Healthy
        }
    }

    /// Memory store with injectable faults around rollout bookkeeping.
    struct HookedStore {
        inner: Arc<MemoryFlagStore>,
        /// `finish_rollout` calls left to fail.
        finish_failures: AtomicUsize,
        /// Closes the flag's active rollout right after a write to this environment,
        /// as an abort from another replica would.
        close_after_write_to: Option<&'static str>,
    }

    impl HookedStore {
        fn new(inner: Arc<MemoryFlagStore>) -> Self {
            Self {
                inner,
                finish_failures: AtomicUsize::new(0),
                close_after_write_to: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl FlagStore for HookedStore {
        async fn create_flag(&self, new: NewFlag) -> Result<Flag, FlagError> {
            self.inner.create_flag(new).await
        }

        async fn get(&self, key: &str) -> Result<Flag, FlagError> {
            self.inner.get(key).await
        }

        async fn list_flags(&self) -> Result<Vec<Flag>, FlagError> {
            self.inner.list_flags().await
        }

        async fn update_flag(&self, key: &str, update: FlagUpdate) -> Result<Flag, FlagError> {
            self.inner.update_flag(key, update).await
        }

        async fn delete_flag(&self, key: &str) -> Result<(), FlagError> {
            self.inner.delete_flag(key).await
        }

        async fn get_binding(
            &self,
            key: &str,
            environment: &str,
        ) -> Result<BindingLookup, FlagError> {
            self.inner.get_binding(key, environment).await
        }

        async fn list_bindings(&self, key: &str) -> Result<Vec<EnvironmentBinding>, FlagError> {
            self.inner.list_bindings(key).await
        }

        async fn list_environment_bindings(
            &self,
            environment: &str,
        ) -> Result<Vec<EnvironmentBinding>, FlagError> {
            self.inner.list_environment_bindings(environment).await
        }

        async fn set_binding(
            &self,
            key: &str,
            environment: &str,
            value: FlagValue,
            actor: &str,
            expected_version: i64,
        ) -> Result<EnvironmentBinding, FlagError> {
            let binding = self
                .inner
                .set_binding(key, environment, value, actor, expected_version)
                .await?;
            if self.close_after_write_to == Some(environment) {
                for record in self.inner.list_rollouts(key).await? {
                    if !record.state.is_terminal() {
                        self.inner
                            .finish_rollout(record.id, RolloutState::RolledBack, Utc::now())
                            .await?;
                    }
                }
            }
            Ok(binding)
        }

        async fn clear_binding(
            &self,
            key: &str,
            environment: &str,
            expected_version: i64,
        ) -> Result<(), FlagError> {
            self.inner.clear_binding(key, environment, expected_version).await
        }

        async fn begin_rollout(&self, record: &RolloutRecord) -> Result<(), FlagError> {
            self.inner.begin_rollout(record).await
        }

        async fn append_transition(
            &self,
            rollout_id: Uuid,
            transition: &RolloutTransition,
        ) -> Result<(), FlagError> {
            self.inner.append_transition(rollout_id, transition).await
        }

        async fn finish_rollout(
            &self,
            rollout_id: Uuid,
            state: RolloutState,
            finished_at: DateTime<Utc>,
        ) -> Result<bool, FlagError> {
            let failing = self
                .finish_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(FlagError::StoreUnavailable("blip".to_string()));
            }
            self.inner.finish_rollout(rollout_id, state, finished_at).await
        }

        async fn get_rollout(&self, id: Uuid) -> Result<RolloutRecord, FlagError> {
            self.inner.get_rollout(id).await
        }

        async fn list_rollouts(&self, key: &str) -> Result<Vec<RolloutRecord>, FlagError> {
            self.inner.list_rollouts(key).await
        }

        async fn ping(&self) -> Result<(), FlagError> {
            self.inner.ping().await
        }
    }

    fn controller_over(store: Arc<dyn FlagStore>) -> RolloutController {
        let resolver = FlagResolver::new(store.clone());
        RolloutController::new(store, resolver, Arc::new(AlwaysHealthy))
    }

    async fn wait_until_applied(store: &MemoryFlagStore) -> Uuid {
        for _ in 0..200 {
            let records = store.list_rollouts("NEW_FEATURE").await.unwrap();
            if let Some(r) = records.first() {
                if matches!(r.state, RolloutState::Applied { .. }) {
                    return r.id;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("rollout never reached its first environment");
    }

    fn envs(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    async fn setup(
        health: Arc<dyn HealthChecker>,
    ) -> (Arc<MemoryFlagStore>, Arc<RolloutController>) {
        let store = Arc::new(MemoryFlagStore::new());
        store
            .create_flag(NewFlag {
                key: "NEW_FEATURE".to_string(),
                description: None,
                kind: FlagKind::Boolean,
                variants: vec![],
                default_value: FlagValue::Bool(false),
            })
            .await
            .unwrap();
        let resolver = FlagResolver::new(store.clone());
        let controller = Arc::new(RolloutController::new(store.clone(), resolver, health));
        (store, controller)
    }

    #[tokio::test]
    async fn test_promote_single_environment() {
        let (store, controller) = setup(Arc::new(AlwaysHealthy)).await;
        let record = controller
            .promote(
                "NEW_FEATURE",
                FlagValue::Bool(true),
                envs(&["dev"]),
                RolloutPolicy::default(),
                "ci",
            )
            .await
            .unwrap();

        assert_eq!(record.state, RolloutState::Completed);
        assert_eq!(record.transitions.len(), 2);

        let resolver = FlagResolver::new(store.clone());
        let dev = resolver
            .evaluate("NEW_FEATURE", &EvaluationContext::new("dev"))
            .await
            .unwrap();
        assert_eq!(dev.value, FlagValue::Bool(true));
        let prod = resolver
            .evaluate("NEW_FEATURE", &EvaluationContext::new("prod"))
            .await
            .unwrap();
        assert_eq!(prod.value, FlagValue::Bool(false));

        let stored = store.get_rollout(record.id).await.unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_unhealthy_staging_rolls_back() {
        let health = ScriptedHealth(HashMap::from([(
            "staging".to_string(),
            HealthStatus::Unhealthy,
        )]));
        let (store, controller) = setup(Arc::new(health)).await;

        // staging starts explicitly off, prod unbound
        store
            .set_binding("NEW_FEATURE", "staging", FlagValue::Bool(false), "alice", 0)
            .await
            .unwrap();

        let policy = RolloutPolicy {
            require_health_check: true,
            soak_secs: 0,
        };
        let err = controller
            .promote(
                "NEW_FEATURE",
                FlagValue::Bool(true),
                envs(&["dev", "staging", "prod"]),
                policy,
                "ci",
            )
            .await
            .unwrap_err();

        let (environment, record) = match err {
            FlagError::HealthCheckFailed { environment, record } => (environment, record),
            other => panic!("expected HealthCheckFailed, got {other:?}"),
        };
        assert_eq!(environment, "staging");
        assert_eq!(record.state, RolloutState::RolledBack);
        assert!(record.finished_at.is_some());

        let last = record.transitions.last().unwrap();
        assert_eq!(last.environment, "staging");
        assert_eq!(last.outcome, StepOutcome::RolledBack);
        assert!(!record.transitions.iter().any(|t| t.environment == "prod"));

        let staging = store.get_binding("NEW_FEATURE", "staging").await.unwrap();
        assert_eq!(staging.value(), Some(&FlagValue::Bool(false)));
        assert_eq!(
            store.get_binding("NEW_FEATURE", "prod").await.unwrap(),
            BindingLookup::Default
        );
        // dev was healthy and stays a minority
        let dev = store.get_binding("NEW_FEATURE", "dev").await.unwrap();
        assert_eq!(dev.value(), Some(&FlagValue::Bool(true)));

        // the slot is free again
        controller
            .promote(
                "NEW_FEATURE",
                FlagValue::Bool(true),
                envs(&["dev"]),
                RolloutPolicy::default(),
                "ci",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failure_never_leaves_a_majority_applied() {
        let health = ScriptedHealth(HashMap::from([("d".to_string(), HealthStatus::Unhealthy)]));
        let (store, controller) = setup(Arc::new(health)).await;
        let policy = RolloutPolicy {
            require_health_check: true,
            soak_secs: 0,
        };

        let err = controller
            .promote(
                "NEW_FEATURE",
                FlagValue::Bool(true),
                envs(&["a", "b", "c", "d", "e"]),
                policy,
                "ci",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlagError::HealthCheckFailed { .. }));

        // d reverted first, then c because a, b, c would still be 3 of 5
        for reverted in ["c", "d", "e"] {
            assert_eq!(
                store.get_binding("NEW_FEATURE", reverted).await.unwrap(),
                BindingLookup::Default
            );
        }
        for kept in ["a", "b"] {
            let binding = store.get_binding("NEW_FEATURE", kept).await.unwrap();
            assert_eq!(binding.value(), Some(&FlagValue::Bool(true)));
        }
    }

    #[tokio::test]
    async fn test_concurrent_promote_is_rejected() {
        let gate = Arc::new(GatedHealth::default());
        let (_store, controller) = setup(gate.clone()).await;
        let policy = RolloutPolicy {
            require_health_check: true,
            soak_secs: 0,
        };

        let first = {
            let controller = controller.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                controller
                    .promote(
                        "NEW_FEATURE",
                        FlagValue::Bool(true),
                        envs(&["dev", "prod"]),
                        policy,
                        "ci",
                    )
                    .await
            })
        };

        gate.entered.notified().await;
        let second = controller
            .promote(
                "NEW_FEATURE",
                FlagValue::Bool(false),
                envs(&["dev"]),
                policy,
                "someone-else",
            )
            .await;
        assert!(matches!(second, Err(FlagError::RolloutInProgress(_))));

        gate.release.notify_one();
        let record = first.await.unwrap().unwrap();
        assert_eq!(record.state, RolloutState::Completed);
    }

    #[tokio::test]
    async fn test_abort_during_soak_rolls_back() {
        let (store, controller) = setup(Arc::new(AlwaysHealthy)).await;
        let policy = RolloutPolicy {
            require_health_check: false,
            soak_secs: 600,
        };

        let running = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .promote(
                        "NEW_FEATURE",
                        FlagValue::Bool(true),
                        envs(&["dev", "prod"]),
                        policy,
                        "ci",
                    )
                    .await
            })
        };

        let rollout_id = wait_until_applied(&store).await;

        let status = controller.abort(rollout_id, "operator").await.unwrap();
        assert!(matches!(status, AbortStatus::Signalled { .. }));

        let err = running.await.unwrap().unwrap_err();
        let record = match err {
            FlagError::RolloutAborted { record } => record,
            other => panic!("expected RolloutAborted, got {other:?}"),
        };
        assert_eq!(record.state, RolloutState::RolledBack);
        assert_eq!(
            store.get_binding("NEW_FEATURE", "dev").await.unwrap(),
            BindingLookup::Default
        );
        assert!(lock(&controller.in_flight).is_empty());
    }

    #[tokio::test]
    async fn test_abort_recovers_orphaned_rollout() {
        let (store, controller) = setup(Arc::new(AlwaysHealthy)).await;
        let orphan = RolloutRecord::new(
            "NEW_FEATURE",
            FlagValue::Bool(true),
            envs(&["dev"]),
            RolloutPolicy::default(),
            "crashed-runner",
        );
        store.begin_rollout(&orphan).await.unwrap();

        let status = controller.abort(orphan.id, "operator").await.unwrap();
        let AbortStatus::Recovered { record } = status else {
            panic!("expected Recovered");
        };
        assert_eq!(record.state, RolloutState::RolledBack);

        assert!(matches!(
            controller.abort(orphan.id, "operator").await,
            Err(FlagError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_from_another_replica_stops_runner() {
        let (store, _) = setup(Arc::new(AlwaysHealthy)).await;
        let runner = Arc::new(controller_over(store.clone()));
        let other = controller_over(store.clone());
        let policy = RolloutPolicy {
            require_health_check: false,
            soak_secs: 1,
        };

        let running = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner
                    .promote(
                        "NEW_FEATURE",
                        FlagValue::Bool(true),
                        envs(&["dev", "prod"]),
                        policy,
                        "ci",
                    )
                    .await
            })
        };

        let rollout_id = wait_until_applied(&store).await;
        let status = other.abort(rollout_id, "operator").await.unwrap();
        assert!(matches!(status, AbortStatus::Recovered { .. }));

        // the slot is free, so the other replica may start its own rollout
        let next = other
            .promote(
                "NEW_FEATURE",
                FlagValue::Bool(true),
                envs(&["staging"]),
                RolloutPolicy::default(),
                "someone-else",
            )
            .await
            .unwrap();
        assert_eq!(next.state, RolloutState::Completed);

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, FlagError::RolloutAborted { .. }));

        assert_eq!(
            store.get_binding("NEW_FEATURE", "prod").await.unwrap(),
            BindingLookup::Default
        );
        assert_eq!(
            store.get_binding("NEW_FEATURE", "dev").await.unwrap(),
            BindingLookup::Default
        );
        let stored = store.get_rollout(rollout_id).await.unwrap();
        assert_eq!(stored.state, RolloutState::RolledBack);
    }

    #[tokio::test]
    async fn test_failed_completion_rolls_back() {
        let (memory, _) = setup(Arc::new(AlwaysHealthy)).await;
        let store = HookedStore::new(memory.clone());
        store.finish_failures.store(1, Ordering::SeqCst);
        let controller = controller_over(Arc::new(store));

        let err = controller
            .promote(
                "NEW_FEATURE",
                FlagValue::Bool(true),
                envs(&["dev", "staging", "prod"]),
                RolloutPolicy::default(),
                "ci",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlagError::StoreUnavailable(_)));

        // reverted back to a minority
        for reverted in ["staging", "prod"] {
            assert_eq!(
                memory.get_binding("NEW_FEATURE", reverted).await.unwrap(),
                BindingLookup::Default
            );
        }
        let dev = memory.get_binding("NEW_FEATURE", "dev").await.unwrap();
        assert_eq!(dev.value(), Some(&FlagValue::Bool(true)));

        let records = memory.list_rollouts("NEW_FEATURE").await.unwrap();
        assert_eq!(records[0].state, RolloutState::RolledBack);

        let retry = controller
            .promote(
                "NEW_FEATURE",
                FlagValue::Bool(true),
                envs(&["prod"]),
                RolloutPolicy::default(),
                "ci",
            )
            .await
            .unwrap();
        assert_eq!(retry.state, RolloutState::Completed);
    }

    #[tokio::test]
    async fn test_close_during_last_apply_rolls_back() {
        let (memory, _) = setup(Arc::new(AlwaysHealthy)).await;
        let mut store = HookedStore::new(memory.clone());
        store.close_after_write_to = Some("prod");
        let controller = controller_over(Arc::new(store));

        let err = controller
            .promote(
                "NEW_FEATURE",
                FlagValue::Bool(true),
                envs(&["dev", "prod"]),
                RolloutPolicy::default(),
                "ci",
            )
            .await
            .unwrap_err();
        let record = match err {
            FlagError::RolloutAborted { record } => record,
            other => panic!("expected RolloutAborted, got {other:?}"),
        };
        assert_eq!(record.state, RolloutState::RolledBack);

        assert_eq!(
            memory.get_binding("NEW_FEATURE", "prod").await.unwrap(),
            BindingLookup::Default
        );
        let dev = memory.get_binding("NEW_FEATURE", "dev").await.unwrap();
        assert_eq!(dev.value(), Some(&FlagValue::Bool(true)));
    }

    #[tokio::test]
    async fn test_rejects_bad_requests_before_writing() {
        let (store, controller) = setup(Arc::new(AlwaysHealthy)).await;

        let wrong_kind = controller
            .promote(
                "NEW_FEATURE",
                FlagValue::Variant("on".to_string()),
                envs(&["dev"]),
                RolloutPolicy::default(),
                "ci",
            )
            .await;
        assert!(matches!(wrong_kind, Err(FlagError::Validation(_))));

        let duplicate = controller
            .promote(
                "NEW_FEATURE",
                FlagValue::Bool(true),
                envs(&["dev", "dev"]),
                RolloutPolicy::default(),
                "ci",
            )
            .await;
        assert!(matches!(duplicate, Err(FlagError::Validation(_))));

        let unknown = controller
            .promote(
                "MISSING",
                FlagValue::Bool(true),
                envs(&["dev"]),
                RolloutPolicy::default(),
                "ci",
            )
            .await;
        assert!(matches!(unknown, Err(FlagError::NotFound(_))));

        assert!(store.list_rollouts("NEW_FEATURE").await.unwrap().is_empty());
        assert!(store.list_bindings("NEW_FEATURE").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_fails_promote() {
        let (store, controller) = setup(Arc::new(AlwaysHealthy)).await;
        store.set_offline(true);

        let result = controller
            .promote(
                "NEW_FEATURE",
                FlagValue::Bool(true),
                envs(&["dev"]),
                RolloutPolicy::default(),
                "ci",
            )
            .await;
        assert!(matches!(result, Err(FlagError::StoreUnavailable(_))));
    }
}
