//! everping-worker: claims queued runs and carries them through execution,
//! metrics and alerting.
//!
//! - [`dispatch`]: the per-run pipeline
//! - [`pool`]: N workers polling the run queue
//! - [`maintenance`]: retention and zombie sweeps

pub mod dispatch;
pub mod error;
pub mod maintenance;
pub mod pool;

#[cfg(all(test, unix))]
mod testing;

pub use dispatch::Dispatcher;
pub use error::{Result, WorkerError};
pub use maintenance::{Maintenance, SweepReport};
pub use pool::WorkerPool;
