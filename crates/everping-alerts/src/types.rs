use chrono::{DateTime, Utc};
use everping_core::Severity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What went wrong. Together with the task name it forms the alert key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// A run ended `FAILED`.
    Failed,
    /// A run ended `TIMEOUT`.
    Timeout,
    /// The task names a job the registry does not contain.
    JobMissing,
    /// A metric sample crossed a configured threshold.
    Threshold(String),
}

impl Condition {
    /// Severity used when the condition has no rule-supplied one.
    pub fn default_severity(&self) -> Severity {
        match self {
            Condition::Failed | Condition::Timeout => Severity::Critical,
            Condition::JobMissing | Condition::Threshold(_) => Severity::Warning,
        }
    }

    pub fn key_for(&self, task_name: &str) -> String {
        format!("{task_name}:{self}")
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Failed => f.write_str("failed"),
            Condition::Timeout => f.write_str("timeout"),
            Condition::JobMissing => f.write_str("job_missing"),
            Condition::Threshold(key) => write!(f, "threshold:{key}"),
        }
    }
}

impl std::str::FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "failed" => Ok(Condition::Failed),
            "timeout" => Ok(Condition::Timeout),
            "job_missing" => Ok(Condition::JobMissing),
            other => match other.strip_prefix("threshold:") {
                Some(key) if !key.is_empty() => Ok(Condition::Threshold(key.to_string())),
                _ => Err(format!("unknown alert condition: {other}")),
            },
        }
    }
}

/// Persisted state of one alert key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub key: String,
    pub task_name: String,
    pub condition: Condition,
    pub message: String,
    pub severity: Severity,
    /// Start of the current episode; reset when a push follows an expired window.
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// No push for this key before this instant.
    pub suppressed_until: DateTime<Utc>,
    /// Number of pushes attempted.
    pub fire_count: u32,
    /// Number of positive evaluations, pushed or not.
    pub occurrences: u32,
}

/// One positive evaluation of an alert key, as it happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: i64,
    pub key: String,
    pub task_name: String,
    pub message: String,
    pub severity: Severity,
    pub at: DateTime<Utc>,
    /// Inside the key's suppression window, so nothing was pushed.
    pub suppressed: bool,
}

/// Rows removed by [`AlertManager::clear`](crate::AlertManager::clear).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cleared {
    pub events: usize,
    pub alerts: usize,
}

/// What [`AlertManager::raise`](crate::AlertManager::raise) did with a positive evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Pushed,
    /// The push was attempted and failed; the window still applies.
    PushFailed(String),
    /// Inside the suppression window; state updated, nothing sent.
    Suppressed,
}
