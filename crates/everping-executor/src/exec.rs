//! `Executor`: runs one claimed run's job as a child process.
//!
//! The child gets its own process group so a timeout can signal the whole
//! tree (shell wrappers, pipelines, backgrounded helpers), not only the
//! direct child. No shell is involved: the rendered argv is exec'd as-is.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::Utc;
use everping_core::{config::WorkerConfig, MetricSample, Run, RunStatus, Task};
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::{
    error::ExecError,
    log::{self, RunLog, Stream},
    output,
    registry::Job,
    truncate::{BoundedLines, MAX_LINE_BYTES},
};

/// Result of one execution; never an `Err`, failures are part of the outcome.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub samples: Vec<MetricSample>,
    pub log_path: Option<PathBuf>,
    pub error: Option<ExecError>,
}

impl ExecOutcome {
    fn failed(log_path: Option<PathBuf>, error: ExecError) -> Self {
        Self {
            status: RunStatus::Failed,
            exit_code: None,
            samples: Vec::new(),
            log_path,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Executor {
    logs_dir: PathBuf,
    default_timeout: Duration,
    kill_grace: Duration,
}

/// How the child ended, before mapping to a run status.
enum Ended {
    Exited(ExitStatus),
    TimedOut(Option<ExitStatus>),
}

impl Executor {
    pub fn new(logs_dir: impl Into<PathBuf>, default_timeout: Duration, kill_grace: Duration) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            default_timeout,
            kill_grace,
        }
    }

    pub fn from_config(logs_dir: impl Into<PathBuf>, worker: &WorkerConfig) -> Self {
        Self::new(
            logs_dir,
            Duration::from_secs(worker.default_timeout_secs),
            Duration::from_secs(worker.kill_grace_secs),
        )
    }

    /// Time budget for `task`: its own override, else the default.
    pub fn timeout_for(&self, task: &Task) -> Duration {
        task.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// Execute `job` for a claimed `run` of `task`.
    ///
    /// Output lines from both pipes are appended to the run log as they
    /// arrive; `OUT=` lines on stdout also become metric samples.
    pub async fn execute(&self, run: &Run, task: &Task, job: &Job) -> ExecOutcome {
        let argv = job.render_argv(&task.name);
        let timeout = self.timeout_for(task);
        let claimed_at = run.claimed_at.unwrap_or_else(Utc::now);
        let path = log::log_path(&self.logs_dir, run.id, claimed_at);

        let header = [
            ("task", task.name.clone()),
            ("run", run.id.to_string()),
            ("job", job.id.clone()),
            ("argv", format!("{argv:?}")),
            ("started", claimed_at.to_rfc3339()),
        ];
        let mut log = match RunLog::create(path.clone(), &header).await {
            Ok(log) => log,
            Err(e) => {
                warn!(run_id = %run.id, path = %path.display(), "cannot create run log: {e}");
                return ExecOutcome::failed(None, ExecError::Io(format!("run log {}: {e}", path.display())));
            }
        };

        debug!(run_id = %run.id, task = %task.name, ?argv, timeout_secs = timeout.as_secs(), "executing");
        let started = Instant::now();
        let mut samples = Vec::new();
        let result = self.drive(&argv, timeout, &mut log, &mut samples).await;
        let elapsed = started.elapsed();

        let mut outcome = match result {
            Ok(Ended::Exited(status)) => {
                let code = exit_code(status);
                if status.success() {
                    ExecOutcome {
                        status: RunStatus::Success,
                        exit_code: code,
                        samples,
                        log_path: None,
                        error: None,
                    }
                } else {
                    ExecOutcome {
                        status: RunStatus::Failed,
                        exit_code: code,
                        samples,
                        log_path: None,
                        error: Some(ExecError::NonZeroExit { code: code.unwrap_or(-1) }),
                    }
                }
            }
            Ok(Ended::TimedOut(status)) => ExecOutcome {
                status: RunStatus::Timeout,
                exit_code: status.and_then(exit_code),
                samples,
                log_path: None,
                error: Some(ExecError::Timeout {
                    secs: timeout.as_secs(),
                }),
            },
            Err(e) => {
                if let Err(log_err) = log.note(&e.to_string()).await {
                    warn!(run_id = %run.id, "cannot write run log: {log_err}");
                }
                ExecOutcome {
                    samples,
                    ..ExecOutcome::failed(None, e)
                }
            }
        };

        let summary = match outcome.exit_code {
            Some(code) => format!("{} exit={code} elapsed={:.2}s", outcome.status, elapsed.as_secs_f64()),
            None => format!("{} elapsed={:.2}s", outcome.status, elapsed.as_secs_f64()),
        };
        if let Err(e) = log.close(&summary).await {
            warn!(run_id = %run.id, "cannot finish run log: {e}");
            if outcome.status == RunStatus::Success {
                outcome.status = RunStatus::Failed;
                outcome.error = Some(e.into());
            }
        }
        outcome.log_path = Some(path);

        info!(
            run_id = %run.id,
            task = %task.name,
            status = %outcome.status,
            exit_code = ?outcome.exit_code,
            samples = outcome.samples.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "run finished"
        );
        outcome
    }

    async fn drive(
        &self,
        argv: &[String],
        timeout: Duration,
        log: &mut RunLog,
        samples: &mut Vec<MetricSample>,
    ) -> Result<Ended, ExecError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecError::Spawn("job has an empty command".into()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("{program}: {e}")))?;
        let pid = child.id();

        let result = self.pump(&mut child, pid, timeout, log, samples).await;
        if result.is_err() {
            // kill_on_drop reaches only the direct child; take the group down.
            signal_group(pid, Signal::Kill);
            let _ = child.wait().await;
        }
        result
    }

    /// Copy output into the log until the child exits or the timeout fires.
    async fn pump(
        &self,
        child: &mut Child,
        pid: Option<u32>,
        timeout: Duration,
        log: &mut RunLog,
        samples: &mut Vec<MetricSample>,
    ) -> Result<Ended, ExecError> {
        let mut stdout = child.stdout.take().map(|s| BoundedLines::new(s, MAX_LINE_BYTES));
        let mut stderr = child.stderr.take().map(|s| BoundedLines::new(s, MAX_LINE_BYTES));

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => {
                        if let Some(found) = output::parse_line(&line, Utc::now()) {
                            samples.extend(found);
                        }
                        log.line(Stream::Stdout, &line).await?;
                    }
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => log.line(Stream::Stderr, &line).await?,
                    None => stderr = None,
                },
                status = child.wait(), if stdout.is_none() && stderr.is_none() => {
                    return Ok(Ended::Exited(status?));
                }
                _ = &mut deadline => {
                    warn!(?pid, timeout_secs = timeout.as_secs(), "run timed out; terminating process group");
                    log.note(&format!("timed out after {}s; sending SIGTERM", timeout.as_secs())).await?;
                    let status = self.terminate(child, pid, log).await?;
                    return Ok(Ended::TimedOut(status));
                }
            }
        }
    }

    /// SIGTERM the group, wait up to the grace period, then SIGKILL it.
    async fn terminate(
        &self,
        child: &mut Child,
        pid: Option<u32>,
        log: &mut RunLog,
    ) -> Result<Option<ExitStatus>, ExecError> {
        signal_group(pid, Signal::Term);
        let status = match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                log.note(&format!(
                    "still running {}s after SIGTERM; sending SIGKILL",
                    self.kill_grace.as_secs()
                ))
                .await?;
                None
            }
        };
        // Sweep the group even when the leader exited; helpers it spawned
        // may have ignored SIGTERM.
        signal_group(pid, Signal::Kill);
        match status {
            Some(status) => Ok(Some(status)),
            None => Ok(child.wait().await.ok()),
        }
    }
}

async fn next_line<R>(reader: &mut Option<BoundedLines<R>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let reader = reader.as_mut()?;
    match reader.next_line().await {
        Ok(Some(line)) => {
            let clean = strip_ansi_escapes::strip(&line.bytes);
            let text = String::from_utf8_lossy(&clean);
            let mut text = text.trim_end_matches('\r').to_string();
            if line.dropped > 0 {
                text.push_str(&format!(" [... {} bytes dropped]", line.dropped));
            }
            Some(text)
        }
        Ok(None) => None,
        Err(e) => {
            debug!("output pipe closed with error: {e}");
            None
        }
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Safety: the child was spawned with process_group(0), so its pid is the
    // id of a group that contains only the job's processes.
    unsafe {
        libc::killpg(pid as libc::pid_t, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| 128 + s))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}
