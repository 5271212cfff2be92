//! Shared fixture for the pipeline, pool and maintenance tests: every store
//! on its own connection to one temporary database file, as in the daemon.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use everping_alerts::{Alert, AlertManager, Notifier};
use everping_core::config::{ThresholdOp, ThresholdRule};
use everping_core::{Run, RunId, RunSource, Severity, Task, Trigger};
use everping_executor::{Executor, Job, JobRegistry};
use everping_metrics::MetricsStore;
use everping_scheduler::{db, NewTask, RunQueue, TaskStore};

use crate::dispatch::Dispatcher;

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pushed: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub(crate) fn pushed(&self) -> Vec<String> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn push(&self, alert: &Alert) -> everping_alerts::Result<()> {
        self.pushed.lock().unwrap().push(alert.key.clone());
        Ok(())
    }
}

pub(crate) struct Harness {
    dir: tempfile::TempDir,
    pub tasks: TaskStore,
    pub queue: RunQueue,
    pub metrics: MetricsStore,
    pub notifier: Arc<RecordingNotifier>,
    pub dispatcher: Arc<Dispatcher>,
}

fn job(id: &str, script: &str) -> Job {
    Job {
        id: id.into(),
        label: id.into(),
        cmd: vec!["sh".into(), "-c".into(), script.into()],
        style: "text".into(),
    }
}

impl Harness {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("everping.db");
        let open = || db::open(&path).unwrap();

        let tasks = TaskStore::new(open()).unwrap();
        let queue = RunQueue::new(open()).unwrap();
        let metrics = MetricsStore::new(open()).unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let rules = vec![ThresholdRule {
            task: "*".into(),
            key: "cpu".into(),
            op: ThresholdOp::Gt,
            value: 90.0,
            severity: Severity::Warning,
        }];
        let alerts = AlertManager::new(open(), notifier.clone(), 900, rules).unwrap();

        let jobs = JobRegistry::from_jobs([
            job("cpu-hot", "echo OUT=cpu=95"),
            job("fails", "echo boom >&2; exit 3"),
            job("sleepy", "sleep 0.3; echo done"),
        ]);
        let executor = Executor::new(
            dir.path().join("logs"),
            Duration::from_secs(10),
            Duration::from_secs(1),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            tasks.clone(),
            queue.clone(),
            Arc::new(jobs),
            executor,
            metrics.clone(),
            Arc::new(alerts),
        ));

        Self {
            dir,
            tasks,
            queue,
            metrics,
            notifier,
            dispatcher,
        }
    }

    pub(crate) fn logs_dir(&self) -> PathBuf {
        self.dir.path().join("logs")
    }

    pub(crate) fn add_task(&self, name: &str, job_id: &str) -> Task {
        self.add_task_with_timeout(name, job_id, None)
    }

    pub(crate) fn add_task_with_timeout(&self, name: &str, job_id: &str, timeout_secs: Option<u64>) -> Task {
        self.tasks
            .add_task(NewTask {
                name: name.into(),
                job_id: job_id.into(),
                trigger: Trigger::Interval { every_secs: 3600 },
                timezone: "UTC".into(),
                enabled: true,
                timeout_secs,
            })
            .unwrap()
    }

    pub(crate) fn enqueue(&self, task: &Task, source: RunSource) -> RunId {
        self.queue.enqueue(&task.id, source, Utc::now()).unwrap().unwrap()
    }

    pub(crate) fn enqueue_and_claim(&self, task: &Task, source: RunSource) -> Run {
        let id = self.enqueue(task, source);
        self.queue.try_claim(id, Utc::now()).unwrap()
    }
}
