use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    BindingLookup, EnvironmentBinding, Flag, FlagKind, FlagStore, FlagUpdate, FlagValue, NewFlag,
};
use crate::error::FlagError;
use crate::rollout::{RolloutPolicy, RolloutRecord, RolloutState, RolloutTransition, StepOutcome};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

const FLAG_COLUMNS: &str =
    "key, description, kind, variants, default_value, created_at, updated_at";
const BINDING_COLUMNS: &str = "flag_key, environment, value, version, updated_at, updated_by";
const ROLLOUT_COLUMNS: &str =
    "id, flag_key, value, environments, policy, actor, created_at, finished_state, finished_at";

/// Durable store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgFlagStore {
    db: PgPool,
}

// Database row types

#[derive(Debug, sqlx::FromRow)]
struct FlagRow {
    key: String,
    description: Option<String>,
    kind: String,
    variants: Vec<String>,
    default_value: Json<FlagValue>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FlagRow> for Flag {
    type Error = FlagError;

    fn try_from(row: FlagRow) -> Result<Self, Self::Error> {
        Ok(Flag {
            kind: FlagKind::parse(&row.kind)?,
            key: row.key,
            description: row.description,
            variants: row.variants,
            default_value: row.default_value.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BindingRow {
    flag_key: String,
    environment: String,
    value: Json<FlagValue>,
    version: i64,
    updated_at: DateTime<Utc>,
    updated_by: String,
}

impl From<BindingRow> for EnvironmentBinding {
    fn from(row: BindingRow) -> Self {
        EnvironmentBinding {
            flag_key: row.flag_key,
            environment: row.environment,
            value: row.value.0,
            version: row.version,
            updated_at: row.updated_at,
            updated_by: row.updated_by,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RolloutRow {
    id: Uuid,
    flag_key: String,
    value: Json<FlagValue>,
    environments: Vec<String>,
    policy: Json<RolloutPolicy>,
    actor: String,
    created_at: DateTime<Utc>,
    finished_state: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct TransitionRow {
    rollout_id: Uuid,
    environment: String,
    outcome: String,
    previous_value: Option<Json<FlagValue>>,
    note: Option<String>,
    at: DateTime<Utc>,
}

impl TryFrom<TransitionRow> for RolloutTransition {
    type Error = FlagError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        let outcome = StepOutcome::parse(&row.outcome).ok_or_else(|| {
            FlagError::StoreUnavailable(format!("unknown step outcome '{}'", row.outcome))
        })?;
        Ok(RolloutTransition {
            environment: row.environment,
            outcome,
            previous_value: row.previous_value.map(|v| v.0),
            note: row.note,
            at: row.at,
        })
    }
}

fn build_record(
    row: RolloutRow,
    transitions: Vec<RolloutTransition>,
) -> Result<RolloutRecord, FlagError> {
    let terminal = match row.finished_state.as_deref() {
        None => None,
        Some(raw) => Some(RolloutState::parse_terminal(raw).ok_or_else(|| {
            FlagError::StoreUnavailable(format!("unknown rollout state '{raw}'"))
        })?),
    };

    let mut record = RolloutRecord {
        id: row.id,
        flag_key: row.flag_key,
        value: row.value.0,
        environments: row.environments,
        policy: row.policy.0,
        actor: row.actor,
        state: RolloutState::Pending,
        created_at: row.created_at,
        finished_at: row.finished_at,
        transitions,
    };
    record.restore_state(terminal);
    Ok(record)
}

fn violates(e: &sqlx::Error, code: &str) -> bool {
    e.as_database_error()
        .and_then(|db_error| db_error.code())
        .as_deref()
        == Some(code)
}

impl PgFlagStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.db).await
    }

    async fn flag_exists(&self, key: &str) -> Result<bool, FlagError> {
        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM flags WHERE key = $1)")
                .bind(key)
                .fetch_one(&self.db)
                .await?;
        Ok(exists)
    }

    /// Explains a check-and-set miss: unknown flag, or the version that won.
    async fn write_miss(
        &self,
        key: &str,
        environment: &str,
        expected_version: i64,
    ) -> Result<FlagError, FlagError> {
        if !self.flag_exists(key).await? {
            return Ok(FlagError::NotFound(key.to_string()));
        }

        let actual = sqlx::query_scalar::<_, i64>(
            "SELECT version FROM flag_bindings WHERE flag_key = $1 AND environment = $2",
        )
        .bind(key)
        .bind(environment)
        .fetch_optional(&self.db)
        .await?
        .unwrap_or(0);

        Ok(FlagError::Conflict {
            expected: expected_version,
            actual,
        })
    }

    async fn transitions_for(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<RolloutTransition>>, FlagError> {
        let rows: Vec<TransitionRow> = sqlx::query_as(
            r#"
            SELECT rollout_id, environment, outcome, previous_value, note, at
            FROM rollout_transitions
            WHERE rollout_id = ANY($1)
            ORDER BY id ASC
            "#,
        )
        .bind(ids)
        .fetch_all(&self.db)
        .await?;

        let mut by_rollout: HashMap<Uuid, Vec<RolloutTransition>> = HashMap::new();
        for row in rows {
            let rollout_id = row.rollout_id;
            by_rollout
                .entry(rollout_id)
                .or_default()
                .push(RolloutTransition::try_from(row)?);
        }
        Ok(by_rollout)
    }
}

#[async_trait]
impl FlagStore for PgFlagStore {
    async fn create_flag(&self, new: NewFlag) -> Result<Flag, FlagError> {
        new.validate()?;

        let row = sqlx::query_as::<_, FlagRow>(&format!(
            r#"
            INSERT INTO flags (key, description, kind, variants, default_value)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {FLAG_COLUMNS}
            "#
        ))
        .bind(&new.key)
        .bind(&new.description)
        .bind(new.kind.as_str())
        .bind(&new.variants)
        .bind(Json(&new.default_value))
        .fetch_one(&self.db)
        .await
        .map_err(|e| {
            if violates(&e, UNIQUE_VIOLATION) {
                FlagError::AlreadyExists(new.key.clone())
            } else {
                e.into()
            }
        })?;

        Flag::try_from(row)
    }

    async fn get(&self, key: &str) -> Result<Flag, FlagError> {
        let row = sqlx::query_as::<_, FlagRow>(&format!(
            "SELECT {FLAG_COLUMNS} FROM flags WHERE key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => Flag::try_from(row),
            None => Err(FlagError::NotFound(key.to_string())),
        }
    }

    async fn list_flags(&self) -> Result<Vec<Flag>, FlagError> {
        let rows = sqlx::query_as::<_, FlagRow>(&format!(
            "SELECT {FLAG_COLUMNS} FROM flags ORDER BY key ASC"
        ))
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(Flag::try_from).collect()
    }

    async fn update_flag(&self, key: &str, update: FlagUpdate) -> Result<Flag, FlagError> {
        if let Some(ref value) = update.default_value {
            self.get(key).await?.check_value(value)?;
        }

        let row = sqlx::query_as::<_, FlagRow>(&format!(
            r#"
            UPDATE flags
            SET
                description = COALESCE($2, description),
                default_value = COALESCE($3, default_value),
                updated_at = NOW()
            WHERE key = $1
            RETURNING {FLAG_COLUMNS}
            "#
        ))
        .bind(key)
        .bind(update.description.as_deref())
        .bind(update.default_value.map(Json))
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => Flag::try_from(row),
            None => Err(FlagError::NotFound(key.to_string())),
        }
    }

    async fn delete_flag(&self, key: &str) -> Result<(), FlagError> {
        let has_bindings = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM flag_bindings WHERE flag_key = $1)",
        )
        .bind(key)
        .fetch_one(&self.db)
        .await?;

        if has_bindings {
            return Err(FlagError::FlagHasBindings(key.to_string()));
        }

        let result = sqlx::query("DELETE FROM flags WHERE key = $1")
            .bind(key)
            .execute(&self.db)
            .await
            .map_err(|e| {
                // a binding was created between the check and the delete
                if violates(&e, FOREIGN_KEY_VIOLATION) {
                    FlagError::FlagHasBindings(key.to_string())
                } else {
                    e.into()
                }
            })?;

        if result.rows_affected() == 0 {
            return Err(FlagError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn get_binding(&self, key: &str, environment: &str) -> Result<BindingLookup, FlagError> {
        let row = sqlx::query_as::<_, BindingRow>(&format!(
            "SELECT {BINDING_COLUMNS} FROM flag_bindings WHERE flag_key = $1 AND environment = $2"
        ))
        .bind(key)
        .bind(environment)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => Ok(BindingLookup::Bound(row.into())),
            None if self.flag_exists(key).await? => Ok(BindingLookup::Default),
            None => Err(FlagError::NotFound(key.to_string())),
        }
    }

    async fn list_bindings(&self, key: &str) -> Result<Vec<EnvironmentBinding>, FlagError> {
        if !self.flag_exists(key).await? {
            return Err(FlagError::NotFound(key.to_string()));
        }

        let rows = sqlx::query_as::<_, BindingRow>(&format!(
            r#"
            SELECT {BINDING_COLUMNS} FROM flag_bindings
            WHERE flag_key = $1
            ORDER BY environment ASC
            "#
        ))
        .bind(key)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(EnvironmentBinding::from).collect())
    }

    async fn list_environment_bindings(
        &self,
        environment: &str,
    ) -> Result<Vec<EnvironmentBinding>, FlagError> {
        let rows = sqlx::query_as::<_, BindingRow>(&format!(
            "SELECT {BINDING_COLUMNS} FROM flag_bindings WHERE environment = $1"
        ))
        .bind(environment)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(EnvironmentBinding::from).collect())
    }

    async fn set_binding(
        &self,
        key: &str,
        environment: &str,
        value: FlagValue,
        actor: &str,
        expected_version: i64,
    ) -> Result<EnvironmentBinding, FlagError> {
        self.get(key).await?.check_value(&value)?;

        let row = if expected_version == 0 {
            sqlx::query_as::<_, BindingRow>(&format!(
                r#"
                INSERT INTO flag_bindings (flag_key, environment, value, version, updated_by)
                VALUES ($1, $2, $3, 1, $4)
                ON CONFLICT (flag_key, environment) DO NOTHING
                RETURNING {BINDING_COLUMNS}
                "#
            ))
            .bind(key)
            .bind(environment)
            .bind(Json(&value))
            .bind(actor)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| {
                if violates(&e, FOREIGN_KEY_VIOLATION) {
                    FlagError::NotFound(key.to_string())
                } else {
                    e.into()
                }
            })?
        } else {
            sqlx::query_as::<_, BindingRow>(&format!(
                r#"
                UPDATE flag_bindings
                SET value = $3, version = version + 1, updated_at = NOW(), updated_by = $4
                WHERE flag_key = $1 AND environment = $2 AND version = $5
                RETURNING {BINDING_COLUMNS}
                "#
            ))
            .bind(key)
            .bind(environment)
            .bind(Json(&value))
            .bind(actor)
            .bind(expected_version)
            .fetch_optional(&self.db)
            .await?
        };

        match row {
            Some(row) => Ok(row.into()),
            None => Err(self.write_miss(key, environment, expected_version).await?),
        }
    }

    async fn clear_binding(
        &self,
        key: &str,
        environment: &str,
        expected_version: i64,
    ) -> Result<(), FlagError> {
        let result = sqlx::query(
            "DELETE FROM flag_bindings WHERE flag_key = $1 AND environment = $2 AND version = $3",
        )
        .bind(key)
        .bind(environment)
        .bind(expected_version)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.write_miss(key, environment, expected_version).await?);
        }
        Ok(())
    }

    async fn begin_rollout(&self, record: &RolloutRecord) -> Result<(), FlagError> {
        sqlx::query(
            r#"
            INSERT INTO rollouts (id, flag_key, value, environments, policy, actor, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(&record.flag_key)
        .bind(Json(&record.value))
        .bind(&record.environments)
        .bind(Json(&record.policy))
        .bind(&record.actor)
        .bind(record.created_at)
        .execute(&self.db)
        .await
        .map_err(|e| {
            if violates(&e, UNIQUE_VIOLATION) {
                FlagError::RolloutInProgress(record.flag_key.clone())
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn append_transition(
        &self,
        rollout_id: Uuid,
        transition: &RolloutTransition,
    ) -> Result<(), FlagError> {
        sqlx::query(
            r#"
            INSERT INTO rollout_transitions
                (rollout_id, environment, outcome, previous_value, note, at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(rollout_id)
        .bind(&transition.environment)
        .bind(transition.outcome.as_str())
        .bind(transition.previous_value.as_ref().map(Json))
        .bind(&transition.note)
        .bind(transition.at)
        .execute(&self.db)
        .await
        .map_err(|e| {
            if violates(&e, FOREIGN_KEY_VIOLATION) {
                FlagError::RolloutNotFound(rollout_id)
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn finish_rollout(
        &self,
        rollout_id: Uuid,
        state: RolloutState,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, FlagError> {
        let result = sqlx::query(
            r#"
            UPDATE rollouts
            SET finished_state = $2, finished_at = $3
            WHERE id = $1 AND finished_state IS NULL
            "#,
        )
        .bind(rollout_id)
        .bind(state.as_str())
        .bind(finished_at)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM rollouts WHERE id = $1)",
            )
            .bind(rollout_id)
            .fetch_one(&self.db)
            .await?;
            if !exists {
                return Err(FlagError::RolloutNotFound(rollout_id));
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn get_rollout(&self, id: Uuid) -> Result<RolloutRecord, FlagError> {
        let row = sqlx::query_as::<_, RolloutRow>(&format!(
            "SELECT {ROLLOUT_COLUMNS} FROM rollouts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(FlagError::RolloutNotFound(id))?;

        let mut transitions = self.transitions_for(&[id]).await?;
        build_record(row, transitions.remove(&id).unwrap_or_default())
    }

    async fn list_rollouts(&self, key: &str) -> Result<Vec<RolloutRecord>, FlagError> {
        let rows = sqlx::query_as::<_, RolloutRow>(&format!(
            "SELECT {ROLLOUT_COLUMNS} FROM rollouts WHERE flag_key = $1 ORDER BY created_at DESC"
        ))
        .bind(key)
        .fetch_all(&self.db)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        // one query for every record's transitions
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut transitions = self.transitions_for(&ids).await?;

        rows.into_iter()
            .map(|row| {
                let steps = transitions.remove(&row.id).unwrap_or_default();
                build_record(row, steps)
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), FlagError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.db)
            .await?;
        Ok(())
    }
}
