//! Sync the `[[tasks]]` list from the config file into the task table.

use everping_core::EverpingConfig;
use everping_scheduler::{NewTask, SyncOutcome, TaskStore};
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
}

/// Upsert every configured task by name.
///
/// A task the config no longer mentions is left alone; `everping disable`
/// stops it. A definition that fails validation is logged and skipped so
/// one typo does not keep the daemon from starting.
pub fn sync_tasks(store: &TaskStore, config: &EverpingConfig) -> SyncReport {
    let mut report = SyncReport::default();
    for entry in &config.tasks {
        let new = NewTask {
            name: entry.name.clone(),
            job_id: entry.job.clone(),
            trigger: entry.trigger.clone(),
            timezone: config.task_timezone(entry).to_string(),
            enabled: entry.enabled,
            timeout_secs: entry.timeout_secs,
        };
        match store.upsert_task(new) {
            Ok((_, SyncOutcome::Created)) => report.created += 1,
            Ok((_, SyncOutcome::Updated)) => report.updated += 1,
            Ok((_, SyncOutcome::Unchanged)) => report.unchanged += 1,
            Err(e) => {
                warn!(task = %entry.name, "task not synced: {e}");
                report.rejected += 1;
            }
        }
    }
    info!(
        created = report.created,
        updated = report.updated,
        unchanged = report.unchanged,
        rejected = report.rejected,
        "tasks synced from config"
    );
    report
}
