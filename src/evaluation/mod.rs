pub mod resolver;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::store::{BindingLookup, Flag, FlagValue};

pub use resolver::FlagResolver;

// Context for evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub environment: String,
    /// Request attributes (user segment, region...). Carried for targeting, not interpreted yet.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl EvaluationContext {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluationReason {
    /// Explicit binding for the requested environment.
    Binding { version: i64 },
    /// No binding, flag default.
    Default,
    /// Store unreachable, cached default served.
    Degraded,
}

// Flag evaluation result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub value: FlagValue,
    pub reason: EvaluationReason,
}

/// Binding for the environment wins, otherwise the flag default.
pub fn resolve(flag: &Flag, binding: &BindingLookup) -> Evaluation {
    match binding {
        BindingLookup::Bound(b) => Evaluation {
            value: b.value.clone(),
            reason: EvaluationReason::Binding { version: b.version },
        },
        BindingLookup::Default => Evaluation {
            value: flag.default_value.clone(),
            reason: EvaluationReason::Default,
        },
    }
}

/// Turns a flag key into the environment-variable name injected into containers.
pub fn env_var_name(key: &str) -> String {
    key.chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
        .collect()
}
