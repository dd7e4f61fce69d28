//! Versioned flag storage.
//!
//! A [`FlagStore`] holds flag definitions, one [`EnvironmentBinding`] per
//! `(flag, environment)` pair and the audit trail of rollouts. Binding writes
//! are check-and-set against the version the writer last read.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::FlagError;
use crate::rollout::{RolloutRecord, RolloutState, RolloutTransition};

pub use memory::MemoryFlagStore;
pub use postgres::PgFlagStore;

// MODELS

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagKind {
    Boolean,
    Variant,
}

impl FlagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagKind::Boolean => "boolean",
            FlagKind::Variant => "variant",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, FlagError> {
        match raw {
            "boolean" => Ok(FlagKind::Boolean),
            "variant" => Ok(FlagKind::Variant),
            other => Err(FlagError::StoreUnavailable(format!(
                "unknown flag kind '{other}' in storage"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Variant(String),
}

impl FlagValue {
    pub fn kind(&self) -> FlagKind {
        match self {
            FlagValue::Bool(_) => FlagKind::Boolean,
            FlagValue::Variant(_) => FlagKind::Variant,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            FlagValue::Variant(_) => None,
        }
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Bool(b) => write!(f, "{b}"),
            FlagValue::Variant(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flag {
    pub key: String,
    pub description: Option<String>,
    pub kind: FlagKind,
    pub variants: Vec<String>,
    pub default_value: FlagValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flag {
    /// Rejects values of the wrong kind or outside the declared variants.
    pub fn check_value(&self, value: &FlagValue) -> Result<(), FlagError> {
        check_value(&self.key, self.kind, &self.variants, value)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFlag {
    pub key: String,
    pub description: Option<String>,
    pub kind: FlagKind,
    #[serde(default)]
    pub variants: Vec<String>,
    pub default_value: FlagValue,
}

impl NewFlag {
    pub fn validate(&self) -> Result<(), FlagError> {
        validate_flag_key(&self.key).map_err(FlagError::Validation)?;

        if self.kind == FlagKind::Boolean && !self.variants.is_empty() {
            return Err(FlagError::Validation(
                "Boolean flags cannot declare variants".to_string(),
            ));
        }
        if self.variants.iter().any(|v| v.trim().is_empty()) {
            return Err(FlagError::Validation("Variants cannot be empty".to_string()));
        }

        check_value(&self.key, self.kind, &self.variants, &self.default_value)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlagUpdate {
    pub description: Option<String>,
    pub default_value: Option<FlagValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentBinding {
    pub flag_key: String,
    pub environment: String,
    pub value: FlagValue,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindingLookup {
    Bound(EnvironmentBinding),
    Default,
}

impl BindingLookup {
    /// Version a writer must echo back; an absent binding is version 0.
    pub fn version(&self) -> i64 {
        match self {
            BindingLookup::Bound(b) => b.version,
            BindingLookup::Default => 0,
        }
    }

    pub fn value(&self) -> Option<&FlagValue> {
        match self {
            BindingLookup::Bound(b) => Some(&b.value),
            BindingLookup::Default => None,
        }
    }
}

// STORE CONTRACT

#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn create_flag(&self, new: NewFlag) -> Result<Flag, FlagError>;

    async fn get(&self, key: &str) -> Result<Flag, FlagError>;

    async fn list_flags(&self) -> Result<Vec<Flag>, FlagError>;

    async fn update_flag(&self, key: &str, update: FlagUpdate) -> Result<Flag, FlagError>;

    /// Fails with `FlagHasBindings` while any environment still binds the flag.
    async fn delete_flag(&self, key: &str) -> Result<(), FlagError>;

    async fn get_binding(&self, key: &str, environment: &str) -> Result<BindingLookup, FlagError>;

    async fn list_bindings(&self, key: &str) -> Result<Vec<EnvironmentBinding>, FlagError>;

    /// Every binding of one environment, for bulk evaluation.
    async fn list_environment_bindings(
        &self,
        environment: &str,
    ) -> Result<Vec<EnvironmentBinding>, FlagError>;

    /// Check-and-set write. `expected_version` is the version last read (0 when unbound).
    async fn set_binding(
        &self,
        key: &str,
        environment: &str,
        value: FlagValue,
        actor: &str,
        expected_version: i64,
    ) -> Result<EnvironmentBinding, FlagError>;

    /// Check-and-set removal, restoring the "resolve to default" state.
    async fn clear_binding(
        &self,
        key: &str,
        environment: &str,
        expected_version: i64,
    ) -> Result<(), FlagError>;

    /// Persists a fresh record; `RolloutInProgress` if the flag already has an active one.
    async fn begin_rollout(&self, record: &RolloutRecord) -> Result<(), FlagError>;

    async fn append_transition(
        &self,
        rollout_id: Uuid,
        transition: &RolloutTransition,
    ) -> Result<(), FlagError>;

    /// First terminal write wins. Returns `false` when the record was already finished.
    async fn finish_rollout(
        &self,
        rollout_id: Uuid,
        state: RolloutState,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, FlagError>;

    async fn get_rollout(&self, id: Uuid) -> Result<RolloutRecord, FlagError>;

    async fn list_rollouts(&self, key: &str) -> Result<Vec<RolloutRecord>, FlagError>;

    async fn ping(&self) -> Result<(), FlagError>;
}

// HELPER FUNCTIONS

fn check_value(
    key: &str,
    kind: FlagKind,
    variants: &[String],
    value: &FlagValue,
) -> Result<(), FlagError> {
    if value.kind() != kind {
        return Err(FlagError::Validation(format!(
            "Flag '{}' is a {} flag, got a {} value",
            key,
            kind.as_str(),
            value.kind().as_str()
        )));
    }

    if let FlagValue::Variant(v) = value {
        if !variants.is_empty() && !variants.contains(v) {
            return Err(FlagError::Validation(format!(
                "'{}' is not a declared variant of flag '{}'",
                v, key
            )));
        }
    }

    Ok(())
}

/// Flag keys double as environment-variable names, so upper case is allowed.
pub fn validate_flag_key(key: &str) -> Result<(), String> {
    let Some(first) = key.chars().next() else {
        return Err("Flag key cannot be empty".to_string());
    };

    if key.len() > 64 {
        return Err("Flag key is too long (Max: 64 characters)".to_string());
    }

    if !first.is_ascii_alphabetic() {
        return Err("Flag key must start with a letter".to_string());
    }

    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(
            "Flag key can only contain letters, numbers, underscores, and hyphens".to_string(),
        );
    }

    Ok(())
}

pub fn validate_environment_key(key: &str) -> Result<(), String> {
    let Some(first) = key.chars().next() else {
        return Err("Environment key cannot be empty".to_string());
    };

    if key.len() > 64 {
        return Err("Environment key is too long (Max: 64 characters)".to_string());
    }

    if !first.is_ascii_alphabetic() {
        return Err("Environment key must start with a letter".to_string());
    }

    if !key.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
        return Err(
            "Environment key can only contain lowercase letters, numbers, underscores, and hyphens"
                .to_string(),
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_environment_key() {
        assert!(validate_environment_key("prod").is_ok());
        assert!(validate_environment_key("staging").is_ok());
        assert!(validate_environment_key("dev-test").is_ok());
        assert!(validate_environment_key("env_123").is_ok());

        assert!(validate_environment_key("").is_err());
        assert!(validate_environment_key("Production").is_err()); // uppercase
        assert!(validate_environment_key("_invalid").is_err());
        assert!(validate_environment_key("has space").is_err());
        assert!(validate_environment_key("has.dot").is_err());
    }

    #[test]
    fn test_validate_flag_key() {
        assert!(validate_flag_key("NEW_FEATURE").is_ok());
        assert!(validate_flag_key("new-checkout").is_ok());

        assert!(validate_flag_key("").is_err());
        assert!(validate_flag_key("1flag").is_err());
        assert!(validate_flag_key("bad key").is_err());
        assert!(validate_flag_key(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_new_flag_default_must_match_kind() {
        let flag = NewFlag {
            key: "NEW_FEATURE".to_string(),
            description: None,
            kind: FlagKind::Boolean,
            variants: vec![],
            default_value: FlagValue::Variant("on".to_string()),
        };
        assert!(matches!(flag.validate(), Err(FlagError::Validation(_))));

        let flag = NewFlag {
            key: "CHECKOUT".to_string(),
            description: None,
            kind: FlagKind::Variant,
            variants: vec!["old".to_string(), "new".to_string()],
            default_value: FlagValue::Variant("beta".to_string()),
        };
        assert!(matches!(flag.validate(), Err(FlagError::Validation(_))));
    }

    #[test]
    fn test_flag_value_json_shape() {
        assert_eq!(serde_json::to_string(&FlagValue::Bool(true)).unwrap(), "true");
        let v: FlagValue = serde_json::from_str("\"blue\"").unwrap();
        assert_eq!(v, FlagValue::Variant("blue".to_string()));
        assert_eq!(v.to_string(), "blue");
    }
}
