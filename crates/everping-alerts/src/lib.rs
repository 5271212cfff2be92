//! `everping-alerts`: de-duplicated alerting on run outcomes and metrics.
//!
//! [`AlertManager`] persists one row per alert key plus an event history,
//! and decides whether a positive evaluation is pushed or suppressed; a
//! [`Notifier`] delivers it.

pub mod db;
pub mod error;
pub mod manager;
pub mod push;
pub mod types;

pub use error::{AlertError, Result};
pub use manager::AlertManager;
pub use push::{LogNotifier, Notifier, ScriptNotifier};
pub use types::{Alert, AlertEvent, Cleared, Condition, Decision};
