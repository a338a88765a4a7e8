//! Redis-backed queue storage, grounded in the apalis-redis namespaced key
//! scheme: each logical queue owns `{queue}:data`, `{queue}:active`,
//! `{queue}:scheduled`, and `{queue}:status:{job_id}`.

use super::models::{FanoutJob, JobStatus, LlmJob};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

const JOB_DATA_HASH: &str = "{queue}:data";
const ACTIVE_JOBS_LIST: &str = "{queue}:active";
const SCHEDULED_JOBS_SET: &str = "{queue}:scheduled";
const STATUS_KEY_PREFIX: &str = "{queue}:status:";
const STATUS_TTL_SECS: u64 = 86400;

const PUSH_JOB_SCRIPT: &str = include_str!("../../resources/lua/push_job.lua");
const SCHEDULE_JOB_SCRIPT: &str = include_str!("../../resources/lua/schedule_job.lua");
const PROMOTE_SCHEDULED_SCRIPT: &str = include_str!("../../resources/lua/promote_scheduled.lua");
const DEQUEUE_JOB_SCRIPT: &str = include_str!("../../resources/lua/dequeue_job.lua");

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

fn now_secs() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp() as f64
}

/// A single named Redis queue (`llm`, `reconciler`, or `recorder`).
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    namespace: String,
    push_job: Script,
    schedule_job: Script,
    promote_scheduled: Script,
    dequeue_job: Script,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
            push_job: Script::new(PUSH_JOB_SCRIPT),
            schedule_job: Script::new(SCHEDULE_JOB_SCRIPT),
            promote_scheduled: Script::new(PROMOTE_SCHEDULED_SCRIPT),
            dequeue_job: Script::new(DEQUEUE_JOB_SCRIPT),
        }
    }

    fn data_hash(&self) -> String {
        JOB_DATA_HASH.replace("{queue}", &self.namespace)
    }

    fn active_list(&self) -> String {
        ACTIVE_JOBS_LIST.replace("{queue}", &self.namespace)
    }

    fn scheduled_set(&self) -> String {
        SCHEDULED_JOBS_SET.replace("{queue}", &self.namespace)
    }

    fn status_key(&self, job_id: &str) -> String {
        format!("{}{job_id}", STATUS_KEY_PREFIX.replace("{queue}", &self.namespace))
    }

    /// Writes `job` onto this queue's active list, returning its id.
    pub async fn enqueue(&self, job: &LlmJob) -> Result<String> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(job)?;
        let status_key = self.status_key(&job.id);
        self.push_job
            .key(self.data_hash())
            .key(self.active_list())
            .arg(&job.id)
            .arg(&payload)
            .arg(&status_key)
            .arg(STATUS_TTL_SECS)
            .invoke_async::<()>(&mut conn)
            .await?;
        debug!(job_id = %job.id, queue = %self.namespace, "job enqueued");
        Ok(job.id.clone())
    }

    /// Schedules `job` (with a freshly minted retry id) to become ready
    /// `delay_secs` from now.
    pub async fn deferred_schedule(&self, mut job: LlmJob, delay_secs: u64) -> Result<String> {
        job.id = format!("{}-retry-{}", job.id, Uuid::new_v4());
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&job)?;
        let ready_at = now_secs() + delay_secs as f64;
        let status_key = self.status_key(&job.id);
        self.schedule_job
            .key(self.data_hash())
            .key(self.scheduled_set())
            .arg(&job.id)
            .arg(&payload)
            .arg(ready_at)
            .arg(&status_key)
            .arg(STATUS_TTL_SECS)
            .invoke_async::<()>(&mut conn)
            .await?;
        debug!(job_id = %job.id, queue = %self.namespace, delay_secs, "job deferred");
        Ok(job.id)
    }

    /// Moves any scheduled jobs whose ready time has elapsed into the active
    /// list. Safe to call from every worker on every dequeue attempt.
    pub async fn promote_scheduled(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        let promoted: i64 = self
            .promote_scheduled
            .key(self.scheduled_set())
            .key(self.active_list())
            .arg(now_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted)
    }

    /// Pops the oldest ready job, if any, after promoting due scheduled jobs.
    pub async fn dequeue(&self) -> Result<Option<LlmJob>> {
        self.promote_scheduled().await?;

        let mut conn = self.conn.clone();
        let result: Option<(String, Option<String>)> = self
            .dequeue_job
            .key(self.active_list())
            .key(self.data_hash())
            .arg(STATUS_KEY_PREFIX.replace("{queue}", &self.namespace))
            .arg(STATUS_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;

        let Some((job_id, payload)) = result else {
            return Ok(None);
        };
        let Some(payload) = payload else {
            return Ok(None);
        };
        let job: LlmJob = serde_json::from_str(&payload)?;
        debug!(job_id = %job_id, queue = %self.namespace, "job dequeued");
        Ok(Some(job))
    }

    /// Writes a job's terminal or intermediate status.
    pub async fn set_status(&self, job_id: &str, status: JobStatus) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(self.status_key(job_id), status.as_str(), STATUS_TTL_SECS)
            .await?;
        Ok(())
    }

    pub async fn status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.status_key(job_id)).await?;
        Ok(raw.and_then(|s| JobStatus::parse(&s)))
    }

    /// Pushes a function-dispatch envelope for a fan-out-only queue
    /// (`reconciler`, `recorder`) that has no `active`/`scheduled` split.
    pub async fn enqueue_fanout(&self, job: &FanoutJob) -> Result<()> {
        let mut conn = self.conn.clone();
        let job_id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(job)?;
        conn.hset::<_, _, _, ()>(self.data_hash(), &job_id, &payload).await?;
        conn.rpush::<_, _, ()>(self.active_list(), &job_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // RedisQueue needs a reachable Redis instance; covered by integration
    // tests rather than unit tests here since `ConnectionManager` has no
    // in-memory fake.
}
