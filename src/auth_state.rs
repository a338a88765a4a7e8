//! Authentication and quota state shared across workers via Redis.
//!
//! A single worker process that hits an auth failure or a quota limit
//! writes a TTL'd marker so every other worker backs off too, instead of
//! each one rediscovering the failure independently.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

const AUTH_KEY: &str = "claude:auth:status";
const QUOTA_KEY: &str = "claude:quota:status";
const LAST_CHECK_KEY: &str = "claude:last:check";
const LAST_CHECK_TTL_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum AuthStateError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AuthStateError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Healthy,
    AuthFailed,
    QuotaExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorState {
    pub status: AuthStatus,
    pub message: String,
    pub timestamp: f64,
    pub retry_at: f64,
    pub retry_after: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LastCheck {
    timestamp: f64,
    status: String,
}

/// Outcome of [`AuthStateManager::is_healthy`].
#[derive(Debug, Clone)]
pub enum Health {
    Healthy,
    Unhealthy { error: ErrorState, retry_in_seconds: u64 },
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub healthy: bool,
    pub timestamp: f64,
    pub last_successful_check: Option<f64>,
    pub error: Option<ErrorState>,
    pub retry_in_seconds: Option<u64>,
}

fn now_secs() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp() as f64
}

/// Tracks Claude auth/quota health in Redis, shared across every worker.
#[derive(Clone)]
pub struct AuthStateManager {
    conn: ConnectionManager,
}

impl AuthStateManager {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Mark authentication as failed. Defaults to a 5 minute retry window.
    pub async fn set_auth_failed(&self, message: &str, retry_after: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let now = now_secs();
        let state = ErrorState {
            status: AuthStatus::AuthFailed,
            message: message.to_string(),
            timestamp: now,
            retry_at: now + retry_after as f64,
            retry_after,
        };
        let ttl = retry_after + 60;
        conn.set_ex::<_, _, ()>(AUTH_KEY, serde_json::to_string(&state)?, ttl)
            .await?;
        warn!(message, retry_after, "auth state set to failed");
        Ok(())
    }

    /// Mark quota as exceeded. Defaults to a 1 hour retry window.
    pub async fn set_quota_exceeded(&self, message: &str, retry_after: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let now = now_secs();
        let state = ErrorState {
            status: AuthStatus::QuotaExceeded,
            message: message.to_string(),
            timestamp: now,
            retry_at: now + retry_after as f64,
            retry_after,
        };
        let ttl = retry_after + 60;
        conn.set_ex::<_, _, ()>(QUOTA_KEY, serde_json::to_string(&state)?, ttl)
            .await?;
        warn!(message, retry_after, "quota state set to exceeded");
        Ok(())
    }

    /// Clear any error state and record a successful check.
    pub async fn set_healthy(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(AUTH_KEY).await?;
        let _: () = conn.del(QUOTA_KEY).await?;
        let last_check = LastCheck {
            timestamp: now_secs(),
            status: "healthy".to_string(),
        };
        conn.set_ex::<_, _, ()>(
            LAST_CHECK_KEY,
            serde_json::to_string(&last_check)?,
            LAST_CHECK_TTL_SECS,
        )
        .await?;
        info!("auth state set to healthy");
        Ok(())
    }

    /// Check auth then quota state. Auth takes precedence when both are set.
    pub async fn is_healthy(&self) -> Result<Health> {
        let mut conn = self.conn.clone();
        let now = now_secs();

        if let Some(raw) = conn.get::<_, Option<String>>(AUTH_KEY).await? {
            let state: ErrorState = serde_json::from_str(&raw)?;
            if state.retry_at > now {
                let retry_in_seconds = (state.retry_at - now).max(0.0) as u64;
                return Ok(Health::Unhealthy { error: state, retry_in_seconds });
            }
        }

        if let Some(raw) = conn.get::<_, Option<String>>(QUOTA_KEY).await? {
            let state: ErrorState = serde_json::from_str(&raw)?;
            if state.retry_at > now {
                let retry_in_seconds = (state.retry_at - now).max(0.0) as u64;
                return Ok(Health::Unhealthy { error: state, retry_in_seconds });
            }
        }

        Ok(Health::Healthy)
    }

    pub async fn get_status(&self) -> Result<StatusReport> {
        let health = self.is_healthy().await?;
        let mut conn = self.conn.clone();
        let last_successful_check = match conn.get::<_, Option<String>>(LAST_CHECK_KEY).await? {
            Some(raw) => {
                let last: LastCheck = serde_json::from_str(&raw)?;
                Some(last.timestamp)
            }
            None => None,
        };

        Ok(match health {
            Health::Healthy => StatusReport {
                healthy: true,
                timestamp: now_secs(),
                last_successful_check,
                error: None,
                retry_in_seconds: None,
            },
            Health::Unhealthy { error, retry_in_seconds } => StatusReport {
                healthy: false,
                timestamp: now_secs(),
                last_successful_check,
                error: Some(error),
                retry_in_seconds: Some(retry_in_seconds),
            },
        })
    }

    /// Whether enough time has passed (and we're not already in an error
    /// state) to justify a background auth probe.
    pub async fn should_check_auth(&self, check_interval_secs: u64) -> Result<bool> {
        let health = self.is_healthy().await?;
        if !health.is_healthy() {
            return Ok(false);
        }

        let mut conn = self.conn.clone();
        if let Some(raw) = conn.get::<_, Option<String>>(LAST_CHECK_KEY).await? {
            let last: LastCheck = serde_json::from_str(&raw)?;
            if now_secs() - last.timestamp < check_interval_secs as f64 {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    // Exercising these against a real Redis instance requires one to be
    // reachable at REDIS_URL; covered by integration tests rather than
    // unit tests here since `ConnectionManager` has no in-memory fake.
}
