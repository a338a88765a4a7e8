//! Job payload types shared between the aligner worker and its fan-out
//! queues.

use crate::providers::{LlmResponse, OutputFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub scraper_id: String,
    pub content_hash: String,
    #[serde(flatten)]
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmJob {
    pub id: String,
    pub prompt: String,
    pub format: Option<OutputFormat>,
    #[serde(default)]
    pub provider_overrides: Option<Value>,
    pub metadata: JobMetadata,
    pub created_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Deferred,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Deferred => "deferred",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(JobStatus::Queued),
            "deferred" => Some(JobStatus::Deferred),
            "started" => Some(JobStatus::Started),
            "finished" => Some(JobStatus::Finished),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResultStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobResultStatus,
    pub result: Option<LlmResponse>,
}

/// A function-dispatch envelope for the `reconciler` and `recorder` fan-out
/// queues: the worker pushes `{function, args}` and downstream consumers
/// (outside this core) match on `function` to decide how to handle `args`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutJob {
    pub function: String,
    pub args: Value,
}

impl FanoutJob {
    pub fn process_job_result(result: JobResult) -> Self {
        Self {
            function: "process_job_result".to_string(),
            args: serde_json::json!([result]),
        }
    }

    pub fn record_result(result: JobResult) -> Self {
        Self {
            function: "record_result".to_string(),
            args: serde_json::json!([result]),
        }
    }
}

pub const QUEUE_LLM: &str = "llm";
pub const QUEUE_RECONCILER: &str = "reconciler";
pub const QUEUE_RECORDER: &str = "recorder";
