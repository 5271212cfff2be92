//! everping-executor: runs a job's argv for a claimed run.
//!
//! - [`registry`]: the read-only job registry (JSON file, hot reload)
//! - [`exec`]: process spawning, timeout with process-group kill, run logs
//! - [`output`]: the `OUT=` metric line protocol
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use everping_executor::{Executor, JobRegistry};
//!
//! # async fn demo(run: everping_core::Run, task: everping_core::Task) {
//! let registry = JobRegistry::load("/etc/everping/jobs.json");
//! let executor = Executor::new("/var/log/everping", Duration::from_secs(60), Duration::from_secs(5));
//!
//! let job = registry.resolve(&task.job_id).unwrap();
//! let outcome = executor.execute(&run, &task, &job).await;
//! println!("{} with {} samples", outcome.status, outcome.samples.len());
//! # }
//! ```

pub mod error;
pub mod exec;
pub mod log;
pub mod output;
pub mod registry;
pub mod truncate;

pub use error::{ExecError, Result};
pub use exec::{ExecOutcome, Executor};
pub use registry::{Job, JobRegistry};
