pub mod routes;

use serde::Deserialize;

use crate::rollout::RolloutPolicy;
use crate::store::FlagValue;

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    pub value: FlagValue,
    /// Applied in this order, e.g. `["dev", "staging", "prod"]`.
    pub environments: Vec<String>,
    #[serde(default)]
    pub policy: RolloutPolicy,
}
