pub mod models;
pub mod storage;

pub use models::{
    FanoutJob, JobMetadata, JobResult, JobResultStatus, JobStatus, LlmJob, QUEUE_LLM,
    QUEUE_RECONCILER, QUEUE_RECORDER,
};
pub use storage::{QueueError, RedisQueue};
