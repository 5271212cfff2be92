//! `everping-scheduler`: task definitions, the trigger engine and the run
//! queue, all persisted in SQLite.
//!
//! # Overview
//!
//! Tasks live in a `tasks` table and runs in a `runs` table. The
//! [`engine::TriggerEngine`] ticks every few seconds and turns due tasks into
//! `PENDING` runs; workers elsewhere claim them through [`queue::RunQueue`].
//! The engine and the workers share nothing but the database.
//!
//! # Trigger kinds
//!
//! | Kind       | Fires                                                |
//! |------------|------------------------------------------------------|
//! | `interval` | Every N seconds, counted from the previous fire      |
//! | `cron`     | Five-field cron expression in the task's timezone    |
//! | `deadline` | Once at a local wall-clock time, then disables itself |

pub mod db;
pub mod engine;
pub mod error;
pub mod queue;
pub mod store;
pub mod trigger;

pub use engine::{TickReport, TriggerEngine};
pub use error::{Result, SchedulerError};
pub use queue::{RunCompletion, RunQueue, ZombiePolicy};
pub use store::{NewTask, SyncOutcome, TaskStore};
