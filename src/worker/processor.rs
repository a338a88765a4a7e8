//! Per-job processing body: the single entry point a worker calls once it
//! has a job in hand and has cleared the auth/quota gate.

use crate::auth_state::AuthStateManager;
use crate::content_store::ContentStore;
use crate::hsds::field_validator::KnownFields;
use crate::hsds::HsdsAligner;
use crate::providers::{LlmResponse, ProviderError, TokenUsage};
use crate::queue::{FanoutJob, JobResult, JobResultStatus, LlmJob};
use crate::queue::storage::RedisQueue;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("alignment failed: {0}")]
    Align(#[from] crate::hsds::AlignError),

    #[error("content store error: {0}")]
    ContentStore(#[from] crate::content_store::StorageError),

    #[error("queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Runs one job to completion: cache lookup, alignment, fan-out.
///
/// Auth and quota errors update [`AuthStateManager`] before propagating so
/// the caller's retry-scheduling logic (C10) can act on fresh state.
#[instrument(skip_all, fields(job_id = %job.id, content_hash = %job.metadata.content_hash))]
pub async fn process_llm_job(
    job: &LlmJob,
    aligner: &HsdsAligner<'_>,
    content_store: Option<&ContentStore>,
    auth_state: &AuthStateManager,
    reconciler: &RedisQueue,
    recorder: &RedisQueue,
    known_fields: Option<&KnownFields>,
) -> Result<LlmResponse> {
    let hash = &job.metadata.content_hash;

    let cached = match content_store {
        Some(store) => store.get_result(hash)?,
        None => None,
    };

    if let Some(cached) = cached {
        info!("serving cached result, skipping aligner");
        let response = LlmResponse {
            text: cached.clone(),
            model: "cache".to_string(),
            usage: TokenUsage::default(),
            raw: serde_json::Value::Null,
            parsed: serde_json::from_str(&cached).ok(),
            validation_details: None,
        };
        return finish(job, response, content_store, reconciler, recorder).await;
    }

    let align_result = aligner.align(&job.prompt, known_fields).await;

    match align_result {
        Ok(payload) => {
            let response = LlmResponse {
                text: serde_json::to_string(&payload.hsds_data).unwrap_or_default(),
                model: String::new(),
                usage: TokenUsage::default(),
                raw: payload.hsds_data.clone(),
                parsed: Some(payload.hsds_data),
                validation_details: None,
            };
            finish(job, response, content_store, reconciler, recorder).await
        }
        Err(crate::hsds::AlignError::Provider(ProviderError::Auth { message, retry_after })) => {
            auth_state.set_auth_failed(&message, retry_after).await.ok();
            Err(ProviderError::Auth { message, retry_after }.into())
        }
        Err(crate::hsds::AlignError::Provider(ProviderError::Quota { message, retry_after })) => {
            auth_state.set_quota_exceeded(&message, retry_after).await.ok();
            Err(ProviderError::Quota { message, retry_after }.into())
        }
        Err(other) => Err(other.into()),
    }
}

async fn finish(
    job: &LlmJob,
    response: LlmResponse,
    content_store: Option<&ContentStore>,
    reconciler: &RedisQueue,
    recorder: &RedisQueue,
) -> Result<LlmResponse> {
    let hash = &job.metadata.content_hash;

    if let (Some(store), Some(parsed)) = (content_store, &response.parsed) {
        let text = serde_json::to_string(parsed).unwrap_or_default();
        store.store_result(hash, &text)?;
    }

    let result = JobResult {
        job_id: job.id.clone(),
        status: JobResultStatus::Completed,
        result: Some(response.clone()),
    };

    reconciler
        .enqueue_fanout(&FanoutJob::process_job_result(result.clone()))
        .await?;
    recorder.enqueue_fanout(&FanoutJob::record_result(result)).await?;

    Ok(response)
}
