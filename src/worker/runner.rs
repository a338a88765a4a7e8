//! The auth-aware worker loop: gates every dequeue on C2 health, probes the
//! provider periodically, and hands ready jobs to the processor (C9).

use super::processor::{process_llm_job, ProcessError};
use crate::auth_state::{AuthStateManager, Health};
use crate::content_store::ContentStore;
use crate::hsds::HsdsAligner;
use crate::providers::{GenerateConfig, Provider, ProviderError};
use crate::queue::storage::RedisQueue;
use crate::queue::JobStatus;
use std::time::Duration;
use tracing::{debug, info, warn};

const GATE_SLEEP: Duration = Duration::from_secs(1);
const IDLE_SLEEP: Duration = Duration::from_millis(250);
const AUTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_CHECK_INTERVAL_SECS: u64 = 60;
const AUTH_PROBE_RETRY_AFTER: u64 = 300;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { poll_interval: IDLE_SLEEP }
    }
}

/// Runs a single probe against the provider and updates auth state.
/// Errors that aren't recognisably auth or quota related are treated as
/// inconclusive (no state change).
pub async fn probe_provider(provider: &dyn Provider, auth_state: &AuthStateManager) {
    let config = GenerateConfig { max_tokens: Some(16), ..Default::default() };
    let probe = tokio::time::timeout(AUTH_PROBE_TIMEOUT, provider.generate("ping", None, Some(&config)));

    match probe.await {
        Ok(Ok(_)) => {
            if let Err(e) = auth_state.set_healthy().await {
                warn!(error = %e, "failed to record healthy probe result");
            }
        }
        Ok(Err(ProviderError::Auth { message, .. })) => {
            auth_state.set_auth_failed(&message, AUTH_PROBE_RETRY_AFTER).await.ok();
        }
        Ok(Err(ProviderError::Quota { message, retry_after })) => {
            auth_state.set_quota_exceeded(&message, retry_after).await.ok();
        }
        Ok(Err(_)) | Err(_) => {
            // Non-auth error or timeout: inconclusive, leave state untouched.
        }
    }
}

/// Drives the `llm` queue: dequeue, gate on auth health, execute, repeat.
pub struct WorkerLoop<'a> {
    pub queue: &'a RedisQueue,
    pub reconciler: &'a RedisQueue,
    pub recorder: &'a RedisQueue,
    pub provider: &'a dyn Provider,
    pub aligner: &'a HsdsAligner<'a>,
    pub content_store: Option<&'a ContentStore>,
    pub auth_state: &'a AuthStateManager,
    pub config: WorkerConfig,
}

impl<'a> WorkerLoop<'a> {
    /// Runs one iteration: dequeue at most one job and process it if the
    /// auth gate allows. Returns `true` if a job was dequeued (regardless of
    /// outcome), so the caller can decide whether to sleep before the next
    /// iteration.
    pub async fn tick(&self) -> bool {
        let health = match self.auth_state.is_healthy().await {
            Ok(health) => health,
            Err(e) => {
                warn!(error = %e, "failed to read auth health, treating as healthy");
                Health::Healthy
            }
        };

        if let Health::Unhealthy { retry_in_seconds, .. } = &health {
            let Some(job) = self.dequeue_quietly().await else {
                return false;
            };
            let delay = (*retry_in_seconds).clamp(1, 300);
            if let Err(e) = self.queue.deferred_schedule(job.clone(), delay).await {
                warn!(job_id = %job.id, error = %e, "failed to defer job");
            }
            if let Err(e) = self.queue.set_status(&job.id, JobStatus::Deferred).await {
                warn!(job_id = %job.id, error = %e, "failed to persist deferred status");
            }
            tokio::time::sleep(GATE_SLEEP).await;
            return true;
        }

        if matches!(
            self.auth_state.should_check_auth(AUTH_CHECK_INTERVAL_SECS).await,
            Ok(true)
        ) {
            probe_provider(self.provider, self.auth_state).await;
        }

        let Some(job) = self.dequeue_quietly().await else {
            return false;
        };

        if let Err(e) = self.queue.set_status(&job.id, JobStatus::Started).await {
            warn!(job_id = %job.id, error = %e, "failed to persist started status");
        }

        let outcome = process_llm_job(
            &job,
            self.aligner,
            self.content_store,
            self.auth_state,
            self.reconciler,
            self.recorder,
            None,
        )
        .await;

        match outcome {
            Ok(_) => {
                if let Err(e) = self.queue.set_status(&job.id, JobStatus::Finished).await {
                    warn!(job_id = %job.id, error = %e, "failed to persist finished status");
                }
            }
            Err(err) => {
                if let Err(e) = self.queue.set_status(&job.id, JobStatus::Failed).await {
                    warn!(job_id = %job.id, error = %e, "failed to persist failed status");
                }
                log_process_error(&job.id, &err);
            }
        }

        true
    }

    async fn dequeue_quietly(&self) -> Option<crate::queue::LlmJob> {
        match self.queue.dequeue().await {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "dequeue failed");
                None
            }
        }
    }

    /// Runs the loop until `should_stop` returns true, sleeping briefly
    /// between empty dequeues so an idle worker doesn't spin.
    pub async fn run_until(&self, mut should_stop: impl FnMut() -> bool) {
        info!("running startup probe before entering worker loop");
        probe_provider(self.provider, self.auth_state).await;
        match self.auth_state.is_healthy().await {
            Ok(Health::Healthy) => info!("provider healthy"),
            Ok(Health::Unhealthy { error, .. }) => {
                warn!(status = ?error.status, "provider unhealthy at startup")
            }
            Err(e) => warn!(error = %e, "could not determine provider health at startup"),
        }

        while !should_stop() {
            let did_work = self.tick().await;
            if !did_work {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }
}

fn log_process_error(job_id: &str, err: &ProcessError) {
    match err {
        ProcessError::Provider(ProviderError::Auth { .. }) | ProcessError::Provider(ProviderError::Quota { .. }) => {
            debug!(job_id, error = %err, "job failed due to auth/quota state, deferred path will retry");
        }
        other => {
            warn!(job_id, error = %other, "job failed");
        }
    }
}
