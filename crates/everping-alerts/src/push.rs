//! Alert delivery.
//!
//! The manager decides *whether* to push; a [`Notifier`] only knows *how*.
//! The daemon picks [`ScriptNotifier`] when `alerts.push.command` is set and
//! falls back to [`LogNotifier`] otherwise.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use everping_core::config::PushConfig;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{AlertError, Result};
use crate::types::Alert;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn push(&self, alert: &Alert) -> Result<()>;
}

/// Build the notifier described by the `[alerts.push]` section.
pub fn from_config(config: &PushConfig) -> Arc<dyn Notifier> {
    if config.command.is_empty() {
        Arc::new(LogNotifier)
    } else {
        Arc::new(ScriptNotifier::new(
            config.command.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        ))
    }
}

/// Writes the alert to the process log and nothing else.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn push(&self, alert: &Alert) -> Result<()> {
        warn!(
            key = %alert.key,
            task = %alert.task_name,
            severity = %alert.severity,
            "ALERT: {}",
            alert.message
        );
        Ok(())
    }
}

/// Runs an external command per alert.
///
/// Each argv element may contain `{message}`, `{severity}`, `{task}` and
/// `{key}`; for example `["notify-send", "-u", "{severity}", "{message}"]`.
/// The command's exit status is logged but does not make the push fail; only
/// a spawn error or the timeout does.
pub struct ScriptNotifier {
    command: Vec<String>,
    timeout: Duration,
}

impl ScriptNotifier {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    fn render(&self, alert: &Alert) -> Vec<String> {
        self.command
            .iter()
            .map(|token| render_token(token, alert))
            .collect()
    }
}

#[async_trait]
impl Notifier for ScriptNotifier {
    fn name(&self) -> &str {
        "script"
    }

    async fn push(&self, alert: &Alert) -> Result<()> {
        let argv = self.render(alert);
        let Some((program, args)) = argv.split_first() else {
            return Err(AlertError::Push("push command is empty".into()));
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AlertError::Push(format!("spawn {program}: {e}")))?;

        // Dropping the future on timeout drops the child, which kills it.
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => {
                info!(key = %alert.key, "alert pushed");
                Ok(())
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(
                    key = %alert.key,
                    status = %output.status,
                    stderr = %stderr.trim(),
                    "push command exited unsuccessfully"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(AlertError::Push(format!("wait {program}: {e}"))),
            Err(_) => Err(AlertError::Push(format!(
                "{program} timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

/// Single-pass `{name}` substitution; substituted text is not rescanned.
fn render_token(token: &str, alert: &Alert) -> String {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let value = match &after[..close] {
                "message" => alert.message.clone(),
                "severity" => alert.severity.to_string(),
                "task" => alert.task_name.clone(),
                "key" => alert.key.clone(),
                _ => return None,
            };
            Some((value, close))
        });
        match value {
            Some((value, close)) => {
                out.push_str(&value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Condition;
    use chrono::Utc;
    use everping_core::Severity;

    fn alert() -> Alert {
        let now = Utc::now();
        Alert {
            key: "backup:failed".into(),
            task_name: "backup".into(),
            condition: Condition::Failed,
            message: "task backup failed: exited with code 2 {key}".into(),
            severity: Severity::Critical,
            first_seen: now,
            last_seen: now,
            suppressed_until: now,
            fire_count: 0,
            occurrences: 1,
        }
    }

    #[test]
    fn renders_placeholders_once() {
        let a = alert();
        assert_eq!(render_token("[{severity}] {task}", &a), "[critical] backup");
        assert_eq!(
            render_token("{message}", &a),
            "task backup failed: exited with code 2 {key}"
        );
        assert_eq!(render_token("{unknown}{key}", &a), "{unknown}backup:failed");
    }

    #[test]
    fn empty_command_means_log_notifier() {
        let n = from_config(&PushConfig::default());
        assert_eq!(n.name(), "log");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_receives_rendered_argv() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pushed.txt");
        let notifier = ScriptNotifier::new(
            vec![
                "sh".into(),
                "-c".into(),
                format!("printf '%s|%s' \"$1\" \"$2\" > {}", out.display()),
                "sh".into(),
                "{severity}".into(),
                "{task}".into(),
            ],
            Duration::from_secs(5),
        );
        notifier.push(&alert()).await.unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "critical|backup");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_script_times_out() {
        let notifier = ScriptNotifier::new(
            vec!["sleep".into(), "5".into()],
            Duration::from_millis(200),
        );
        assert!(matches!(notifier.push(&alert()).await, Err(AlertError::Push(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_script_is_only_logged() {
        let notifier = ScriptNotifier::new(vec!["false".into()], Duration::from_secs(5));
        assert!(notifier.push(&alert()).await.is_ok());
    }
}
