pub mod routes;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::evaluation::{Evaluation, EvaluationContext};

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    #[serde(flatten)]
    pub context: EvaluationContext,
    /// Restrict to these keys; every flag when absent.
    pub flags: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    pub environment: String,
    pub flags: BTreeMap<String, Evaluation>,
}
