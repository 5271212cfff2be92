//! The per-run pipeline: task lookup, job resolution, execution, then the
//! terminal write followed by metrics and alerts.

use std::sync::Arc;

use chrono::Utc;
use everping_alerts::AlertManager;
use everping_core::{Run, RunSource, RunStatus, Task};
use everping_executor::{ExecOutcome, Executor, JobRegistry};
use everping_metrics::MetricsStore;
use everping_scheduler::{RunCompletion, RunQueue, TaskStore};
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Everything a worker needs to carry a claimed run to a terminal state.
///
/// Cheap to share: the stores are `Clone` handles over their own connections
/// and the registry is read through an `Arc`.
pub struct Dispatcher {
    tasks: TaskStore,
    queue: RunQueue,
    jobs: Arc<JobRegistry>,
    executor: Executor,
    metrics: MetricsStore,
    alerts: Arc<AlertManager>,
}

impl Dispatcher {
    pub fn new(
        tasks: TaskStore,
        queue: RunQueue,
        jobs: Arc<JobRegistry>,
        executor: Executor,
        metrics: MetricsStore,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            tasks,
            queue,
            jobs,
            executor,
            metrics,
            alerts,
        }
    }

    pub fn queue(&self) -> &RunQueue {
        &self.queue
    }

    /// Claim the oldest pending run, if any.
    pub fn claim(&self) -> Result<Option<Run>> {
        Ok(self.queue.claim_next(Utc::now())?)
    }

    /// Drive a claimed run to its terminal state and return that state.
    ///
    /// Only persistence errors on the run itself come back as `Err`; the run
    /// then stays `RUNNING` until the zombie sweep fails it.
    pub async fn dispatch(&self, run: Run) -> Result<RunStatus> {
        let task = match self.tasks.get_task(&run.task_id)? {
            Some(task) => task,
            None => return self.skip(&run, "task deleted"),
        };
        // A manual fire is an explicit request and runs even when disabled.
        if !task.enabled && run.source == RunSource::Schedule {
            return self.skip(&run, "task disabled");
        }

        let job = match self.jobs.resolve(&task.job_id) {
            Ok(job) => job,
            Err(e) => return self.job_missing(&run, &task, &e.to_string()).await,
        };

        let outcome = self.executor.execute(&run, &task, &job).await;
        let recorded = self.queue.finish(run.id, completion(&outcome))?;
        if !recorded {
            // Reaped as a zombie while executing; the stored outcome stands.
            warn!(run_id = %run.id, task = %task.name, "run no longer RUNNING; outcome discarded");
            return Ok(outcome.status);
        }

        self.record_metrics(&task, &outcome);
        self.notify(&task, &outcome).await;
        Ok(outcome.status)
    }

    fn skip(&self, run: &Run, reason: &str) -> Result<RunStatus> {
        info!(run_id = %run.id, task_id = %run.task_id, reason, "run skipped");
        self.queue.finish(
            run.id,
            RunCompletion {
                status: RunStatus::Skipped,
                finished_at: Utc::now(),
                exit_code: None,
                log_path: None,
                error: Some(reason.to_string()),
            },
        )?;
        Ok(RunStatus::Skipped)
    }

    /// The task names a job the registry does not have: fail the run, disable
    /// the task, raise `job_missing`.
    async fn job_missing(&self, run: &Run, task: &Task, reason: &str) -> Result<RunStatus> {
        warn!(run_id = %run.id, task = %task.name, job_id = %task.job_id, "{reason}");
        let now = Utc::now();
        self.queue.finish(
            run.id,
            RunCompletion {
                status: RunStatus::Failed,
                finished_at: now,
                exit_code: None,
                log_path: None,
                error: Some(reason.to_string()),
            },
        )?;
        self.tasks.disable_with_error(&task.id, reason)?;
        if let Err(e) = self.alerts.on_job_missing(&task.name, &task.job_id, now).await {
            error!(task = %task.name, "cannot record job_missing alert: {e}");
        }
        Ok(RunStatus::Failed)
    }

    fn record_metrics(&self, task: &Task, outcome: &ExecOutcome) {
        if outcome.samples.is_empty() {
            return;
        }
        match self.metrics.append(&task.name, &outcome.samples) {
            Ok(n) => debug!(task = %task.name, samples = n, "metrics stored"),
            Err(e) => error!(task = %task.name, "cannot store metrics: {e}"),
        }
    }

    async fn notify(&self, task: &Task, outcome: &ExecOutcome) {
        let now = Utc::now();
        let detail = outcome.error.as_ref().map(|e| e.to_string());
        if let Err(e) = self
            .alerts
            .on_run_finished(&task.name, outcome.status, detail.as_deref(), now)
            .await
        {
            error!(task = %task.name, "cannot evaluate run alert: {e}");
        }
        if let Err(e) = self.alerts.on_metrics(&task.name, &outcome.samples, now).await {
            error!(task = %task.name, "cannot evaluate metric thresholds: {e}");
        }
    }
}

fn completion(outcome: &ExecOutcome) -> RunCompletion {
    RunCompletion {
        status: outcome.status,
        finished_at: Utc::now(),
        exit_code: outcome.exit_code,
        log_path: outcome
            .log_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
        error: outcome.error.as_ref().map(|e| e.to_string()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[tokio::test]
    async fn success_stores_metrics_and_raises_thresholds() {
        let h = Harness::new();
        let task = h.add_task("web", "cpu-hot");
        let run = h.enqueue_and_claim(&task, RunSource::Manual);

        let status = h.dispatcher.dispatch(run.clone()).await.unwrap();
        assert_eq!(status, RunStatus::Success);

        let stored = h.queue.get_run(run.id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.exit_code, Some(0));
        let log_path = stored.log_path.unwrap();
        assert!(std::fs::read_to_string(log_path).unwrap().contains("[out] OUT=cpu=95"));

        let latest = h.metrics.latest("web", "cpu").unwrap().unwrap();
        assert_eq!(latest.value, 95.0);
        assert_eq!(h.notifier.pushed(), vec!["web:threshold:cpu"]);
    }

    #[tokio::test]
    async fn failure_raises_critical_alert() {
        let h = Harness::new();
        let task = h.add_task("broken", "fails");
        let run = h.enqueue_and_claim(&task, RunSource::Schedule);

        assert_eq!(h.dispatcher.dispatch(run.clone()).await.unwrap(), RunStatus::Failed);
        let stored = h.queue.get_run(run.id).unwrap().unwrap();
        assert_eq!(stored.exit_code, Some(3));
        assert_eq!(stored.error.as_deref(), Some("exited with code 3"));
        assert_eq!(h.notifier.pushed(), vec!["broken:failed"]);
    }

    #[tokio::test]
    async fn unknown_job_disables_task() {
        let h = Harness::new();
        let task = h.add_task("orphan", "no-such-job");
        let run = h.enqueue_and_claim(&task, RunSource::Schedule);

        assert_eq!(h.dispatcher.dispatch(run.clone()).await.unwrap(), RunStatus::Failed);
        let stored = h.queue.get_run(run.id).unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some("job not found: no-such-job"));

        let task = h.tasks.get_by_name("orphan").unwrap().unwrap();
        assert!(!task.enabled);
        assert!(task.last_error.unwrap().contains("no-such-job"));
        assert_eq!(h.notifier.pushed(), vec!["orphan:job_missing"]);
    }

    #[tokio::test]
    async fn disabled_task_skips_scheduled_run_only() {
        let h = Harness::new();
        let task = h.add_task("paused", "cpu-hot");
        let scheduled = h.enqueue_and_claim(&task, RunSource::Schedule);
        h.tasks.set_enabled("paused", false).unwrap();

        assert_eq!(h.dispatcher.dispatch(scheduled).await.unwrap(), RunStatus::Skipped);

        let manual = h.enqueue_and_claim(&task, RunSource::Manual);
        assert_eq!(h.dispatcher.dispatch(manual).await.unwrap(), RunStatus::Success);
    }

    #[tokio::test]
    async fn deleted_task_is_skipped() {
        let h = Harness::new();
        let task = h.add_task("gone", "cpu-hot");
        let run = h.enqueue_and_claim(&task, RunSource::Schedule);
        h.tasks.remove_task("gone").unwrap();

        assert_eq!(h.dispatcher.dispatch(run.clone()).await.unwrap(), RunStatus::Skipped);
        let stored = h.queue.get_run(run.id).unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some("task deleted"));
        assert!(h.notifier.pushed().is_empty());
    }
}
