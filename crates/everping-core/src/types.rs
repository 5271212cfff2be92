use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;

/// Unique identifier for a scheduled task (UUID v4 string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Row id of a run. Assigned by SQLite, strictly increasing, so it doubles as
/// the FIFO tie-breaker when two runs share a `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub i64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// When a task fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Every `every_secs` seconds, measured from the previous fire.
    Interval { every_secs: u64 },

    /// Five-field cron expression (`min hour dom mon dow`), evaluated in the
    /// task's timezone.
    Cron { expression: String },

    /// Once, at or after a local wall-clock time (`2026-03-01T09:00:00`) in
    /// the task's timezone. The task disables itself after firing.
    Deadline { at: String },
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Interval { .. } => "interval",
            Trigger::Cron { .. } => "cron",
            Trigger::Deadline { .. } => "deadline",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Interval { every_secs } => write!(f, "every {every_secs}s"),
            Trigger::Cron { expression } => write!(f, "cron '{expression}'"),
            Trigger::Deadline { at } => write!(f, "once at {at}"),
        }
    }
}

/// A scheduled unit of work, owned by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Unique, human-facing name. Metrics and alerts are keyed by it.
    pub name: String,
    /// Job registry id resolved at execution time.
    pub job_id: String,
    pub trigger: Trigger,
    /// IANA timezone name used for cron and deadline evaluation.
    pub timezone: String,
    pub enabled: bool,
    /// Overrides the worker's default execution timeout.
    pub timeout_secs: Option<u64>,
    /// Derived by the trigger engine; `None` until first computed and after a
    /// deadline task has fired.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Configuration error that disabled the task, if any.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Waiting in the queue.
    Pending,
    /// Claimed by exactly one worker.
    Running,
    /// Exited with code 0.
    Success,
    /// Non-zero exit, spawn failure, missing job, or reaped as a zombie.
    Failed,
    /// Killed after exceeding its time budget.
    Timeout,
    /// Task was disabled or deleted between enqueue and claim.
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
            RunStatus::Timeout => "TIMEOUT",
            RunStatus::Skipped => "SKIPPED",
        }
    }

    /// `PENDING` or `RUNNING`: counts against the one-active-run-per-task rule.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            "TIMEOUT" => Ok(RunStatus::Timeout),
            "SKIPPED" => Ok(RunStatus::Skipped),
            other => Err(CoreError::UnknownVariant {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

/// What put a run in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    Schedule,
    Manual,
}

impl RunSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunSource::Schedule => "schedule",
            RunSource::Manual => "manual",
        }
    }
}

impl std::str::FromStr for RunSource {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(RunSource::Schedule),
            "manual" => Ok(RunSource::Manual),
            other => Err(CoreError::UnknownVariant {
                kind: "run source",
                value: other.to_string(),
            }),
        }
    }
}

/// One execution attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub task_id: TaskId,
    pub status: RunStatus,
    pub source: RunSource,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub log_path: Option<String>,
    /// Short failure description (spawn error, timeout, zombie reap).
    pub error: Option<String>,
}

/// A numeric sample extracted from an `OUT=` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub key: String,
    pub value: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Warning
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(CoreError::UnknownVariant {
                kind: "severity",
                value: other.to_string(),
            }),
        }
    }
}
