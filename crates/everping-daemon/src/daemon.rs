//! `everping run`: wire every subsystem to the database and run until a
//! shutdown signal.

use std::sync::Arc;

use chrono::Utc;
use everping_alerts::{push, AlertManager};
use everping_core::EverpingConfig;
use everping_executor::{Executor, JobRegistry};
use everping_metrics::MetricsStore;
use everping_scheduler::{db, RunQueue, TaskStore, TriggerEngine};
use everping_worker::{Dispatcher, Maintenance, WorkerPool};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::sync::sync_tasks;

pub async fn run(config: EverpingConfig) -> anyhow::Result<()> {
    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");

    // Each subsystem gets its own connection; they meet only in the tables.
    let tasks = TaskStore::new(db::open(&db_path)?)?;
    let queue = RunQueue::new(db::open(&db_path)?)?;
    let metrics = MetricsStore::new(db::open(&db_path)?)?;
    let alerts = AlertManager::new(
        db::open(&db_path)?,
        push::from_config(&config.alerts.push),
        config.alerts.suppress_secs,
        config.alerts.thresholds.clone(),
    )?;
    let engine = TriggerEngine::new(db::open(&db_path)?, &config.scheduler)?;
    info!("database ready");

    sync_tasks(&tasks, &config);
    queue.recover_orphans(Utc::now())?;

    let jobs = Arc::new(JobRegistry::load(&config.jobs.file));
    if jobs.is_empty() {
        warn!(path = %config.jobs.file, "job registry is empty; every run will fail until it is reloaded");
    }

    let dispatcher = Arc::new(Dispatcher::new(
        tasks,
        queue.clone(),
        Arc::clone(&jobs),
        Executor::from_config(&config.logs.dir, &config.worker),
        metrics.clone(),
        Arc::new(alerts),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx.clone()));
    let maintenance = Maintenance::new(queue, metrics, &config);
    let maintenance_task = tokio::spawn(maintenance.run(shutdown_rx));
    let pool = WorkerPool::start(dispatcher, &config.worker);

    info!(workers = pool.len(), "everping running");
    wait_for_shutdown(&jobs).await?;

    info!("shutdown requested; waiting for in-flight runs");
    let _ = shutdown_tx.send(true);
    pool.shutdown_and_join().await;
    let _ = engine_task.await;
    let _ = maintenance_task.await;
    info!("everping stopped");
    Ok(())
}

/// Block until Ctrl-C or SIGTERM. SIGHUP reloads the job registry.
#[cfg(unix)]
async fn wait_for_shutdown(jobs: &JobRegistry) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => return Ok(res?),
            _ = terminate.recv() => return Ok(()),
            _ = hangup.recv() => match jobs.reload() {
                Ok(count) => info!(count, "job registry reloaded"),
                Err(e) => warn!("job registry reload failed, keeping previous jobs: {e}"),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_jobs: &JobRegistry) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Ensure the parent directory for a file path exists.
pub fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
