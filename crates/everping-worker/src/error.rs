use thiserror::Error;

/// Failures of the run pipeline itself, as opposed to a run failing.
///
/// A job exiting non-zero is an outcome and never shows up here; these are
/// persistence errors that leave the pipeline unable to record an outcome.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] everping_scheduler::SchedulerError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] everping_metrics::MetricsError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
