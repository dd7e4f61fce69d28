pub mod routes;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rollout::HealthStatus;
use crate::store::{BindingLookup, EnvironmentBinding, Flag, FlagValue};

// MODELS

#[derive(Debug, Deserialize)]
pub struct SetBindingRequest {
    pub value: FlagValue,
    /// Version from the last read; 0 when the environment had no binding.
    pub expected_version: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingSource {
    Binding,
    Default,
}

#[derive(Debug, Serialize)]
pub struct BindingResponse {
    pub flag_key: String,
    pub environment: String,
    pub value: FlagValue,
    pub version: i64,
    pub source: BindingSource,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

impl From<EnvironmentBinding> for BindingResponse {
    fn from(b: EnvironmentBinding) -> Self {
        BindingResponse {
            flag_key: b.flag_key,
            environment: b.environment,
            value: b.value,
            version: b.version,
            source: BindingSource::Binding,
            updated_at: Some(b.updated_at),
            updated_by: Some(b.updated_by),
        }
    }
}

impl BindingResponse {
    pub fn from_lookup(flag: &Flag, environment: &str, lookup: BindingLookup) -> Self {
        match lookup {
            BindingLookup::Bound(b) => b.into(),
            BindingLookup::Default => BindingResponse {
                flag_key: flag.key.clone(),
                environment: environment.to_string(),
                value: flag.default_value.clone(),
                version: 0,
                source: BindingSource::Default,
                updated_at: None,
                updated_by: None,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HealthSignalRequest {
    pub status: HealthStatus,
    pub detail: Option<String>,
}
