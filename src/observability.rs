//! Structured logging setup and lightweight in-process counters.

use crate::config::{LogFormat, LoggingConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Initialises the global `tracing` subscriber once at process start.
/// `RUST_LOG` overrides `logging.level` when set, matching `EnvFilter`'s
/// usual precedence.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match config.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Plain => subscriber.init(),
    }
}

/// In-process counters for job outcomes. Not exported as metrics (no
/// metrics/OTLP exporter is in scope); useful for periodic log summaries.
#[derive(Debug, Default)]
pub struct Metrics {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_deferred: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_deferred(&self) {
        self.jobs_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_deferred: self.jobs_deferred.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_deferred: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let metrics = Metrics::new();
        metrics.job_completed();
        metrics.job_completed();
        metrics.job_failed();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_completed, 2);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.jobs_deferred, 0);
    }
}
