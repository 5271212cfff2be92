//! Operator commands. Each opens the database directly, so they work with or
//! without a running daemon; a fired run waits for a worker either way.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use everping_alerts::{AlertManager, LogNotifier};
use everping_core::{EverpingConfig, RunSource, Task};
use everping_executor::JobRegistry;
use everping_metrics::MetricsStore;
use everping_scheduler::{db, RunQueue, TaskStore};

use crate::daemon::ensure_parent_dir;

pub struct Console {
    tasks: TaskStore,
    queue: RunQueue,
    metrics: MetricsStore,
    alerts: AlertManager,
    jobs_file: String,
}

impl Console {
    pub fn open(config: &EverpingConfig) -> anyhow::Result<Self> {
        let path = &config.database.path;
        ensure_parent_dir(path);
        let open = || db::open(path).with_context(|| format!("opening {path}"));
        Ok(Self {
            tasks: TaskStore::new(open()?)?,
            queue: RunQueue::new(open()?)?,
            metrics: MetricsStore::new(open()?)?,
            alerts: AlertManager::new(
                open()?,
                Arc::new(LogNotifier),
                config.alerts.suppress_secs,
                Vec::new(),
            )?,
            jobs_file: config.jobs.file.clone(),
        })
    }

    pub fn tasks(&self) -> anyhow::Result<String> {
        let tasks = self.tasks.list_tasks()?;
        if tasks.is_empty() {
            return Ok("no tasks\n".into());
        }
        let mut out = format!(
            "{:<20} {:<8} {:<14} {:<28} {}\n",
            "NAME", "ENABLED", "JOB", "TRIGGER", "NEXT FIRE"
        );
        for t in tasks {
            let next = t
                .next_fire_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".into());
            let _ = writeln!(
                out,
                "{:<20} {:<8} {:<14} {:<28} {}",
                t.name,
                if t.enabled { "yes" } else { "no" },
                t.job_id,
                t.trigger.to_string(),
                next
            );
            if let Some(err) = t.last_error {
                let _ = writeln!(out, "{:<20} error: {err}", "");
            }
        }
        Ok(out)
    }

    pub fn runs(&self, task: Option<&str>, limit: usize) -> anyhow::Result<String> {
        let task = task.map(|name| self.find_task(name)).transpose()?;
        let runs = self.queue.recent_runs(task.as_ref().map(|t| &t.id), limit)?;
        if runs.is_empty() {
            return Ok("no runs\n".into());
        }
        let names: HashMap<_, _> = self
            .tasks
            .list_tasks()?
            .into_iter()
            .map(|t| (t.id, t.name))
            .collect();
        let mut out = format!(
            "{:>6} {:<20} {:<8} {:<8} {:<25} {:>5} {}\n",
            "ID", "TASK", "STATUS", "SOURCE", "CREATED", "EXIT", "ERROR"
        );
        for r in runs {
            let _ = writeln!(
                out,
                "{:>6} {:<20} {:<8} {:<8} {:<25} {:>5} {}",
                r.id.to_string(),
                names.get(&r.task_id).map(String::as_str).unwrap_or("(deleted)"),
                r.status.as_str(),
                r.source.as_str(),
                r.created_at.to_rfc3339(),
                r.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                r.error.unwrap_or_default()
            );
        }
        Ok(out)
    }

    pub fn fire(&self, name: &str) -> anyhow::Result<String> {
        let task = self.find_task(name)?;
        Ok(match self.queue.enqueue(&task.id, RunSource::Manual, Utc::now())? {
            Some(id) => format!("queued run {id} for {name}\n"),
            None => format!("{name} already has an active run; nothing queued\n"),
        })
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> anyhow::Result<String> {
        let task = self.tasks.set_enabled(name, enabled)?;
        let state = if task.enabled { "enabled" } else { "disabled" };
        Ok(format!("{name} {state}\n"))
    }

    pub fn jobs(&self) -> anyhow::Result<String> {
        let registry = JobRegistry::load(&self.jobs_file);
        let mut out = String::new();
        if let Some(err) = registry.last_error() {
            let _ = writeln!(out, "warning: {err}");
        }
        for job in registry.list() {
            let _ = writeln!(out, "{:<16} {:<24} {:?}", job.id, job.label, job.cmd);
        }
        if registry.is_empty() {
            out.push_str("no jobs\n");
        }
        Ok(out)
    }

    pub fn alerts(&self) -> anyhow::Result<String> {
        let alerts = self.alerts.list_alerts()?;
        if alerts.is_empty() {
            return Ok("no alerts\n".into());
        }
        let mut out = String::new();
        for a in alerts {
            let _ = writeln!(
                out,
                "{:<30} {:<8} pushed={} seen={} last={} until={}\n    {}",
                a.key,
                a.severity.as_str(),
                a.fire_count,
                a.occurrences,
                a.last_seen.to_rfc3339(),
                a.suppressed_until.to_rfc3339(),
                a.message
            );
        }
        Ok(out)
    }

    pub fn alert_history(&self, key: Option<&str>, limit: usize) -> anyhow::Result<String> {
        let events = self.alerts.history(key, limit)?;
        if events.is_empty() {
            return Ok("no alert history\n".into());
        }
        let mut out = format!("{:<25} {:<30} {:<8} {:<10} {}\n", "AT", "KEY", "SEVERITY", "PUSHED", "MESSAGE");
        for e in events {
            let _ = writeln!(
                out,
                "{:<25} {:<30} {:<8} {:<10} {}",
                e.at.to_rfc3339(),
                e.key,
                e.severity.as_str(),
                if e.suppressed { "suppressed" } else { "yes" },
                e.message
            );
        }
        Ok(out)
    }

    pub fn clear_runs(&self) -> anyhow::Result<String> {
        let n = self.queue.clear_finished()?;
        Ok(format!("removed {n} finished runs\n"))
    }

    pub fn clear_metrics(&self, task: Option<&str>) -> anyhow::Result<String> {
        if let Some(name) = task {
            self.find_task(name)?;
        }
        let n = self.metrics.clear(task)?;
        Ok(format!("removed {n} metric samples\n"))
    }

    pub fn clear_alerts(&self) -> anyhow::Result<String> {
        let cleared = self.alerts.clear(Utc::now())?;
        Ok(format!(
            "removed {} alert events and {} closed alerts\n",
            cleared.events, cleared.alerts
        ))
    }

    pub fn metrics(&self, task: &str, key: &str, since_hours: Option<u32>) -> anyhow::Result<String> {
        let since = since_hours.map(|h| Utc::now() - Duration::hours(i64::from(h)));
        let series = self.metrics.series(task, key, since)?;
        if series.is_empty() {
            let keys = self.metrics.keys(task)?;
            return Ok(if keys.is_empty() {
                format!("no metrics for {task}\n")
            } else {
                format!("no samples for {task}/{key}; known keys: {}\n", keys.join(", "))
            });
        }
        let mut out = String::new();
        for s in series {
            let _ = writeln!(out, "{}\t{}", s.ts.to_rfc3339(), s.value);
        }
        Ok(out)
    }

    fn find_task(&self, name: &str) -> anyhow::Result<Task> {
        self.tasks
            .get_by_name(name)?
            .with_context(|| format!("no task named {name}"))
    }
}
