//! Ordered promotion of a flag value across environments.

pub mod controller;
pub mod health;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::FlagValue;

pub use controller::RolloutController;
pub use health::{HealthChecker, HealthStatus, SignalHealthChecker};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPolicy {
    /// Gate each advance on `HealthChecker::check` for the environment just applied.
    #[serde(default)]
    pub require_health_check: bool,
    /// Wait between steps; abort is observed while waiting.
    #[serde(default)]
    pub soak_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RolloutState {
    Pending,
    Applying { environment: String },
    Applied { environment: String },
    Completed,
    RolledBack,
}

impl RolloutState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutState::Completed | RolloutState::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutState::Pending => "pending",
            RolloutState::Applying { .. } => "applying",
            RolloutState::Applied { .. } => "applied",
            RolloutState::Completed => "completed",
            RolloutState::RolledBack => "rolled_back",
        }
    }

    /// Parses a persisted terminal state; active states are never stored.
    pub fn parse_terminal(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(RolloutState::Completed),
            "rolled_back" => Some(RolloutState::RolledBack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Pending,
    Applied,
    RolledBack,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Pending => "pending",
            StepOutcome::Applied => "applied",
            StepOutcome::RolledBack => "rolled_back",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(StepOutcome::Pending),
            "applied" => Some(StepOutcome::Applied),
            "rolled_back" => Some(StepOutcome::RolledBack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutTransition {
    pub environment: String,
    pub outcome: StepOutcome,
    /// Value before the rollout touched the environment; `None` means unbound.
    pub previous_value: Option<FlagValue>,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

impl RolloutTransition {
    pub fn new(environment: &str, outcome: StepOutcome, previous_value: Option<FlagValue>) -> Self {
        Self {
            environment: environment.to_string(),
            outcome,
            previous_value,
            note: None,
            at: Utc::now(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Audit record of one promotion. Transitions are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutRecord {
    pub id: Uuid,
    pub flag_key: String,
    pub value: FlagValue,
    pub environments: Vec<String>,
    pub policy: RolloutPolicy,
    pub actor: String,
    pub state: RolloutState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<RolloutTransition>,
}

impl RolloutRecord {
    pub fn new(
        flag_key: &str,
        value: FlagValue,
        environments: Vec<String>,
        policy: RolloutPolicy,
        actor: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            flag_key: flag_key.to_string(),
            value,
            environments,
            policy,
            actor: actor.to_string(),
            state: RolloutState::Pending,
            created_at: Utc::now(),
            finished_at: None,
            transitions: Vec::new(),
        }
    }

    pub fn push(&mut self, transition: RolloutTransition) {
        self.transitions.push(transition);
        if !self.state.is_terminal() {
            self.state = derive_state(None, &self.transitions);
        }
    }

    pub fn finish(&mut self, state: RolloutState, at: DateTime<Utc>) {
        self.state = state;
        self.finished_at = Some(at);
    }

    /// Recomputes `state` from persisted parts; used when loading from storage.
    pub fn restore_state(&mut self, terminal: Option<RolloutState>) {
        self.state = derive_state(terminal, &self.transitions);
    }
}

fn derive_state(terminal: Option<RolloutState>, transitions: &[RolloutTransition]) -> RolloutState {
    if let Some(state) = terminal {
        return state;
    }
    match transitions.last() {
        None => RolloutState::Pending,
        Some(t) => match t.outcome {
            StepOutcome::Pending => RolloutState::Applying {
                environment: t.environment.clone(),
            },
            StepOutcome::Applied => RolloutState::Applied {
                environment: t.environment.clone(),
            },
            // reverts happen only on the way to RolledBack
            StepOutcome::RolledBack => RolloutState::Applying {
                environment: t.environment.clone(),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_follows_transitions() {
        let mut record = RolloutRecord::new(
            "NEW_FEATURE",
            FlagValue::Bool(true),
            vec!["dev".to_string(), "prod".to_string()],
            RolloutPolicy::default(),
            "ci",
        );
        assert_eq!(record.state, RolloutState::Pending);

        record.push(RolloutTransition::new("dev", StepOutcome::Pending, None));
        assert_eq!(
            record.state,
            RolloutState::Applying { environment: "dev".to_string() }
        );

        record.push(RolloutTransition::new("dev", StepOutcome::Applied, None));
        assert_eq!(
            record.state,
            RolloutState::Applied { environment: "dev".to_string() }
        );

        record.finish(RolloutState::Completed, Utc::now());
        assert!(record.state.is_terminal());
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn test_restore_state_prefers_terminal() {
        let mut record = RolloutRecord::new(
            "NEW_FEATURE",
            FlagValue::Bool(true),
            vec!["dev".to_string()],
            RolloutPolicy::default(),
            "ci",
        );
        record.transitions.push(RolloutTransition::new("dev", StepOutcome::Applied, None));

        record.restore_state(None);
        assert_eq!(record.state.as_str(), "applied");

        record.restore_state(RolloutState::parse_terminal("rolled_back"));
        assert_eq!(record.state, RolloutState::RolledBack);
    }
}
