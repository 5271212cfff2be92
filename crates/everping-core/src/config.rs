use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::{Severity, Trigger};

pub const DEFAULT_TICK_SECS: u64 = 2;
pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_KILL_GRACE_SECS: u64 = 5;
pub const DEFAULT_ZOMBIE_SECS: u64 = 3600;
pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 5;
pub const DEFAULT_METRICS_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_SUPPRESS_SECS: u64 = 900;
pub const DEFAULT_PUSH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Top-level config (everping.toml + EVERPING_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EverpingConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    /// Tasks declared in the file; synced into the task table by name on start.
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Fallback IANA timezone for tasks that don't name one.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Seconds between SIGTERM and SIGKILL on timeout.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// A run left RUNNING longer than this is failed by the maintenance sweep.
    #[serde(default = "default_zombie_secs")]
    pub zombie_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            kill_grace_secs: DEFAULT_KILL_GRACE_SECS,
            zombie_secs: DEFAULT_ZOMBIE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    #[serde(default = "default_logs_dir")]
    pub dir: String,
    /// Days of per-run log directories kept; 0 keeps everything.
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            dir: default_logs_dir(),
            retention_days: DEFAULT_LOG_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// 0 disables pruning.
    #[serde(default = "default_metrics_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_METRICS_RETENTION_DAYS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_suppress_secs")]
    pub suppress_secs: u64,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub thresholds: Vec<ThresholdRule>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            suppress_secs: DEFAULT_SUPPRESS_SECS,
            push: PushConfig::default(),
            thresholds: Vec::new(),
        }
    }
}

/// External push command. Each argv element may contain `{message}`,
/// `{severity}`, `{task}` and `{key}`. An empty command logs alerts only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_push_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: DEFAULT_PUSH_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl ThresholdOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ThresholdOp::Gt => ">",
            ThresholdOp::Ge => ">=",
            ThresholdOp::Lt => "<",
            ThresholdOp::Le => "<=",
            ThresholdOp::Eq => "==",
            ThresholdOp::Ne => "!=",
        }
    }

    pub fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            ThresholdOp::Gt => lhs > rhs,
            ThresholdOp::Ge => lhs >= rhs,
            ThresholdOp::Lt => lhs < rhs,
            ThresholdOp::Le => lhs <= rhs,
            ThresholdOp::Eq => lhs == rhs,
            ThresholdOp::Ne => lhs != rhs,
        }
    }
}

/// Raise `threshold:<key>` for a task when a sample satisfies `value <op> limit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    /// Task name, or `*` for every task.
    #[serde(default = "wildcard")]
    pub task: String,
    pub key: String,
    pub op: ThresholdOp,
    pub value: f64,
    #[serde(default)]
    pub severity: Severity,
}

impl ThresholdRule {
    pub fn applies_to(&self, task_name: &str, key: &str) -> bool {
        (self.task == "*" || self.task == task_name) && self.key == key
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_jobs_file")]
    pub file: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            file: default_jobs_file(),
        }
    }
}

/// A `[[tasks]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub job: String,
    pub trigger: Trigger,
    pub timezone: Option<String>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub timeout_secs: Option<u64>,
}

fn bool_true() -> bool {
    true
}
fn wildcard() -> String {
    "*".to_string()
}
fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_kill_grace_secs() -> u64 {
    DEFAULT_KILL_GRACE_SECS
}
fn default_zombie_secs() -> u64 {
    DEFAULT_ZOMBIE_SECS
}
fn default_log_retention_days() -> u32 {
    DEFAULT_LOG_RETENTION_DAYS
}
fn default_metrics_retention_days() -> u32 {
    DEFAULT_METRICS_RETENTION_DAYS
}
fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}
fn default_suppress_secs() -> u64 {
    DEFAULT_SUPPRESS_SECS
}
fn default_push_timeout_secs() -> u64 {
    DEFAULT_PUSH_TIMEOUT_SECS
}

fn everping_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.everping", home)
}
fn default_db_path() -> String {
    format!("{}/everping.db", everping_home())
}
fn default_logs_dir() -> String {
    format!("{}/logs", everping_home())
}
fn default_jobs_file() -> String {
    format!("{}/jobs.json", everping_home())
}

impl EverpingConfig {
    /// Load config from a TOML file with EVERPING_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. $EVERPING_CONFIG
    ///   3. ~/.everping/everping.toml
    ///
    /// A missing file is not an error; every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(EverpingConfig::default()))
            .merge(Toml::file(path))
            .merge(
                Env::prefixed("EVERPING_")
                    .ignore(&["CONFIG"])
                    .split("__"),
            )
    }

    /// Timezone for a task: its own, else the scheduler default.
    pub fn task_timezone<'a>(&'a self, task: &'a TaskConfig) -> &'a str {
        task.timezone
            .as_deref()
            .unwrap_or(self.scheduler.timezone.as_str())
    }
}

pub fn default_config_path() -> String {
    std::env::var("EVERPING_CONFIG")
        .unwrap_or_else(|_| format!("{}/everping.toml", everping_home()))
}
