//! In-process store for tests and `STORE_BACKEND=memory` runs. Not durable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BindingLookup, EnvironmentBinding, Flag, FlagStore, FlagUpdate, FlagValue, NewFlag};
use crate::error::FlagError;
use crate::rollout::{RolloutRecord, RolloutState, RolloutTransition};

#[derive(Default)]
struct Inner {
    flags: BTreeMap<String, Flag>,
    // keyed (flag, environment) so a flag's bindings are one contiguous range
    bindings: BTreeMap<(String, String), EnvironmentBinding>,
    rollouts: HashMap<Uuid, RolloutRecord>,
}

#[derive(Default)]
pub struct MemoryFlagStore {
    inner: RwLock<Inner>,
    #[cfg(test)]
    offline: AtomicBool,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with `StoreUnavailable` until switched back.
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_online(&self) -> Result<(), FlagError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(FlagError::StoreUnavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_online(&self) -> Result<(), FlagError> {
        Ok(())
    }
}

fn binding_key(key: &str, environment: &str) -> (String, String) {
    (key.to_string(), environment.to_string())
}

fn bindings_of<'a>(
    inner: &'a Inner,
    key: &'a str,
) -> impl Iterator<Item = &'a EnvironmentBinding> + 'a {
    inner
        .bindings
        .range((key.to_string(), String::new())..)
        .take_while(move |((flag, _), _)| flag == key)
        .map(|(_, b)| b)
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn create_flag(&self, new: NewFlag) -> Result<Flag, FlagError> {
        self.check_online()?;
        new.validate()?;

        let mut inner = self.inner.write().await;
        if inner.flags.contains_key(&new.key) {
            return Err(FlagError::AlreadyExists(new.key));
        }

        let now = Utc::now();
        let flag = Flag {
            key: new.key,
            description: new.description,
            kind: new.kind,
            variants: new.variants,
            default_value: new.default_value,
            created_at: now,
            updated_at: now,
        };
        inner.flags.insert(flag.key.clone(), flag.clone());
        Ok(flag)
    }

    async fn get(&self, key: &str) -> Result<Flag, FlagError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        inner
            .flags
            .get(key)
            .cloned()
            .ok_or_else(|| FlagError::NotFound(key.to_string()))
    }

    async fn list_flags(&self) -> Result<Vec<Flag>, FlagError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        Ok(inner.flags.values().cloned().collect())
    }

    async fn update_flag(&self, key: &str, update: FlagUpdate) -> Result<Flag, FlagError> {
        self.check_online()?;
        let mut inner = self.inner.write().await;
        let flag = inner
            .flags
            .get_mut(key)
            .ok_or_else(|| FlagError::NotFound(key.to_string()))?;

        if let Some(ref value) = update.default_value {
            flag.check_value(value)?;
        }
        if let Some(description) = update.description {
            flag.description = Some(description);
        }
        if let Some(value) = update.default_value {
            flag.default_value = value;
        }
        flag.updated_at = Utc::now();
        Ok(flag.clone())
    }

    async fn delete_flag(&self, key: &str) -> Result<(), FlagError> {
        self.check_online()?;
        let mut inner = self.inner.write().await;
        if !inner.flags.contains_key(key) {
            return Err(FlagError::NotFound(key.to_string()));
        }
        if bindings_of(&inner, key).next().is_some() {
            return Err(FlagError::FlagHasBindings(key.to_string()));
        }
        inner.flags.remove(key);
        Ok(())
    }

    async fn get_binding(&self, key: &str, environment: &str) -> Result<BindingLookup, FlagError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        if !inner.flags.contains_key(key) {
            return Err(FlagError::NotFound(key.to_string()));
        }
        Ok(match inner.bindings.get(&binding_key(key, environment)) {
            Some(b) => BindingLookup::Bound(b.clone()),
            None => BindingLookup::Default,
        })
    }

    async fn list_bindings(&self, key: &str) -> Result<Vec<EnvironmentBinding>, FlagError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        if !inner.flags.contains_key(key) {
            return Err(FlagError::NotFound(key.to_string()));
        }
        Ok(bindings_of(&inner, key).cloned().collect())
    }

    async fn list_environment_bindings(
        &self,
        environment: &str,
    ) -> Result<Vec<EnvironmentBinding>, FlagError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        Ok(inner
            .bindings
            .values()
            .filter(|b| b.environment == environment)
            .cloned()
            .collect())
    }

    async fn set_binding(
        &self,
        key: &str,
        environment: &str,
        value: FlagValue,
        actor: &str,
        expected_version: i64,
    ) -> Result<EnvironmentBinding, FlagError> {
        self.check_online()?;
        let mut inner = self.inner.write().await;
        let flag = inner
            .flags
            .get(key)
            .ok_or_else(|| FlagError::NotFound(key.to_string()))?;
        flag.check_value(&value)?;

        let slot = binding_key(key, environment);
        let actual = inner.bindings.get(&slot).map(|b| b.version).unwrap_or(0);
        if actual != expected_version {
            return Err(FlagError::Conflict {
                expected: expected_version,
                actual,
            });
        }

        let binding = EnvironmentBinding {
            flag_key: key.to_string(),
            environment: environment.to_string(),
            value,
            version: actual + 1,
            updated_at: Utc::now(),
            updated_by: actor.to_string(),
        };
        inner.bindings.insert(slot, binding.clone());
        Ok(binding)
    }

    async fn clear_binding(
        &self,
        key: &str,
        environment: &str,
        expected_version: i64,
    ) -> Result<(), FlagError> {
        self.check_online()?;
        let mut inner = self.inner.write().await;
        if !inner.flags.contains_key(key) {
            return Err(FlagError::NotFound(key.to_string()));
        }

        let slot = binding_key(key, environment);
        let actual = inner.bindings.get(&slot).map(|b| b.version).unwrap_or(0);
        if actual != expected_version {
            return Err(FlagError::Conflict {
                expected: expected_version,
                actual,
            });
        }
        inner.bindings.remove(&slot);
        Ok(())
    }

    async fn begin_rollout(&self, record: &RolloutRecord) -> Result<(), FlagError> {
        self.check_online()?;
        let mut inner = self.inner.write().await;
        let active = inner
            .rollouts
            .values()
            .any(|r| r.flag_key == record.flag_key && !r.state.is_terminal());
        if active {
            return Err(FlagError::RolloutInProgress(record.flag_key.clone()));
        }
        inner.rollouts.insert(record.id, record.clone());
        Ok(())
    }

    async fn append_transition(
        &self,
        rollout_id: Uuid,
        transition: &RolloutTransition,
    ) -> Result<(), FlagError> {
        self.check_online()?;
        let mut inner = self.inner.write().await;
        let record = inner
            .rollouts
            .get_mut(&rollout_id)
            .ok_or(FlagError::RolloutNotFound(rollout_id))?;
        record.push(transition.clone());
        Ok(())
    }

    async fn finish_rollout(
        &self,
        rollout_id: Uuid,
        state: RolloutState,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, FlagError> {
        self.check_online()?;
        let mut inner = self.inner.write().await;
        let record = inner
            .rollouts
            .get_mut(&rollout_id)
            .ok_or(FlagError::RolloutNotFound(rollout_id))?;
        if record.state.is_terminal() {
            return Ok(false);
        }
        record.finish(state, finished_at);
        Ok(true)
    }

    async fn get_rollout(&self, id: Uuid) -> Result<RolloutRecord, FlagError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        inner
            .rollouts
            .get(&id)
            .cloned()
            .ok_or(FlagError::RolloutNotFound(id))
    }

    async fn list_rollouts(&self, key: &str) -> Result<Vec<RolloutRecord>, FlagError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        let mut records: Vec<RolloutRecord> = inner
            .rollouts
            .values()
            .filter(|r| r.flag_key == key)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn ping(&self) -> Result<(), FlagError> {
        self.check_online()
    }
}
