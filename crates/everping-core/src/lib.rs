//! `everping-core`: types and configuration shared by every everping crate.
//!
//! Nothing in here touches the database or spawns processes; the scheduler,
//! executor, metrics and alert crates all depend on this one and on nothing
//! else inside the workspace.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use config::EverpingConfig;
pub use error::{CoreError, Result};
pub use types::{
    MetricSample, Run, RunId, RunSource, RunStatus, Severity, Task, TaskId, Trigger,
};
