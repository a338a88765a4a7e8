//! The job-processing worker: an auth-aware loop (C10) driving a per-job
//! processor (C9).

pub mod processor;
pub mod runner;

pub use processor::{process_llm_job, ProcessError};
pub use runner::{probe_provider, WorkerConfig, WorkerLoop};
