use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// External health signal consulted before a rollout advances.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, environment: &str) -> HealthStatus;
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSignal {
    pub environment: String,
    pub status: HealthStatus,
    pub detail: Option<String>,
    pub reported_by: String,
    pub reported_at: DateTime<Utc>,
}

const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Holds the latest signal pushed per environment by the pipeline.
/// Missing or expired signals count as unhealthy.
pub struct SignalHealthChecker {
    ttl: Duration,
    signals: RwLock<HashMap<String, HealthSignal>>,
}

impl SignalHealthChecker {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            // capped at ten years to stay inside chrono's range
            ttl: Duration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64),
            signals: RwLock::new(HashMap::new()),
        }
    }

    pub async fn report(&self, signal: HealthSignal) {
        tracing::info!(
            environment = %signal.environment,
            status = ?signal.status,
            reported_by = %signal.reported_by,
            "health signal received"
        );
        self.signals
            .write()
            .await
            .insert(signal.environment.clone(), signal);
    }

    pub async fn latest(&self, environment: &str) -> Option<HealthSignal> {
        self.signals.read().await.get(environment).cloned()
    }
}

#[async_trait]
impl HealthChecker for SignalHealthChecker {
    async fn check(&self, environment: &str) -> HealthStatus {
        let Some(signal) = self.latest(environment).await else {
            tracing::warn!(environment, "no health signal reported");
            return HealthStatus::Unhealthy;
        };

        if Utc::now() - signal.reported_at > self.ttl {
            tracing::warn!(
                environment,
                reported_at = %signal.reported_at,
                "health signal expired"
            );
            return HealthStatus::Unhealthy;
        }

        signal.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(environment: &str, status: HealthStatus, age_secs: i64) -> HealthSignal {
        HealthSignal {
            environment: environment.to_string(),
            status,
            detail: None,
            reported_by: "ci".to_string(),
            reported_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn test_missing_signal_is_unhealthy() {
        let checker = SignalHealthChecker::new(300);
        assert_eq!(checker.check("staging").await, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_latest_signal_wins() {
        let checker = SignalHealthChecker::new(300);
        checker.report(signal("staging", HealthStatus::Unhealthy, 10)).await;
        checker.report(signal("staging", HealthStatus::Healthy, 0)).await;
        assert_eq!(checker.check("staging").await, HealthStatus::Healthy);
        assert_eq!(checker.check("prod").await, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_expired_signal_is_unhealthy() {
        let checker = SignalHealthChecker::new(60);
        checker.report(signal("staging", HealthStatus::Healthy, 120)).await;
        assert_eq!(checker.check("staging").await, HealthStatus::Unhealthy);
    }
}
