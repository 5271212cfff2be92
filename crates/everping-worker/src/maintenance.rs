//! Periodic housekeeping: metric retention, run-log retention and zombie
//! runs. Nothing here is on the hot path; the first sweep runs at startup.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use everping_core::EverpingConfig;
use everping_executor::log::prune_dirs;
use everping_metrics::MetricsStore;
use everping_scheduler::{RunQueue, ZombiePolicy};
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::Result;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub zombies: usize,
    pub metric_rows: usize,
    pub log_dirs: usize,
}

pub struct Maintenance {
    queue: RunQueue,
    metrics: MetricsStore,
    logs_dir: PathBuf,
    log_retention_days: u32,
    metrics_retention_days: u32,
    zombie_policy: ZombiePolicy,
    interval: Duration,
}

impl Maintenance {
    pub fn new(queue: RunQueue, metrics: MetricsStore, config: &EverpingConfig) -> Self {
        Self {
            queue,
            metrics,
            logs_dir: PathBuf::from(&config.logs.dir),
            log_retention_days: config.logs.retention_days,
            metrics_retention_days: config.metrics.retention_days,
            zombie_policy: ZombiePolicy::from_config(&config.worker),
            interval: Duration::from_secs(config.metrics.sweep_interval_secs.max(1)),
        }
    }

    /// One pass of every sweep, as of `now`.
    ///
    /// Each step runs even if an earlier one failed; the first error is
    /// returned after all of them.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let zombies = self.queue.reap_zombies(now, &self.zombie_policy);
        let metric_rows = self.metrics.prune(now, self.metrics_retention_days);

        match prune_dirs(&self.logs_dir, now, self.log_retention_days).await {
            Ok(n) => report.log_dirs = n,
            Err(e) => error!(dir = %self.logs_dir.display(), "run log retention failed: {e}"),
        }
        report.zombies = zombies?;
        report.metric_rows = metric_rows?;
        Ok(report)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "maintenance started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep_at(Utc::now()).await {
                        Ok(report) if report != SweepReport::default() => info!(
                            zombies = report.zombies,
                            metric_rows = report.metric_rows,
                            log_dirs = report.log_dirs,
                            "maintenance sweep"
                        ),
                        Ok(_) => {}
                        Err(e) => error!("maintenance sweep error: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("maintenance shutting down");
                        break;
                    }
                }
            }
        }
    }
}
