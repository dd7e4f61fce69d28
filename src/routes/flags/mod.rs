pub mod routes;

use serde::Serialize;

use crate::store::{Flag, FlagKind, FlagValue};

// Request bodies are the store's own `NewFlag` and `FlagUpdate`.

#[derive(Debug, Serialize)]
pub struct FlagResponse {
    pub key: String,
    pub description: Option<String>,
    pub kind: FlagKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<String>,
    pub default_value: FlagValue,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<Flag> for FlagResponse {
    fn from(flag: Flag) -> Self {
        FlagResponse {
            key: flag.key,
            description: flag.description,
            kind: flag.kind,
            variants: flag.variants,
            default_value: flag.default_value,
            created_at: flag.created_at,
            updated_at: flag.updated_at,
        }
    }
}
