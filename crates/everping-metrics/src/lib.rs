//! everping-metrics: append-only numeric samples extracted from run output.
//!
//! Samples are keyed by task name (not id) so a series survives deleting
//! and re-creating a task under the same name.

pub mod db;
pub mod error;
pub mod store;

pub use error::{MetricsError, Result};
pub use store::MetricsStore;
