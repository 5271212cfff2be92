use chrono::{DateTime, Utc};
use everping_core::config::SchedulerConfig;
use everping_core::time::{fmt_ts, parse_ts};
use everping_core::{RunSource, TaskId, Trigger};
use rusqlite::{params, Connection};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    db::init_db,
    error::Result,
    queue::insert_if_idle,
    store::disable_with_error,
    trigger,
};

/// What one tick did; returned for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tasks that got their first `next_fire_at`.
    pub scheduled: usize,
    /// Runs enqueued.
    pub fired: usize,
    /// Due tasks skipped because a run is still active.
    pub busy: usize,
    /// Tasks disabled for a configuration error.
    pub disabled: usize,
}

struct DueRow {
    id: TaskId,
    name: String,
    trigger_raw: String,
    timezone: String,
    /// Stored text, parsed per task so one bad row cannot fail the tick.
    next_fire_raw: Option<String>,
}

/// Turns due tasks into `PENDING` runs. Never executes anything.
pub struct TriggerEngine {
    conn: Connection,
    tick_secs: u64,
}

impl TriggerEngine {
    /// Create a new engine, initialising the DB schema if needed.
    pub fn new(conn: Connection, config: &SchedulerConfig) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn,
            tick_secs: config.tick_secs.max(1),
        })
    }

    pub fn tick(&mut self) -> Result<TickReport> {
        self.tick_at(Utc::now())
    }

    /// Evaluate every enabled task against `now`.
    ///
    /// A task with an active run is left alone even when due, with its
    /// `next_fire_at` unchanged, so it fires exactly once on the first tick
    /// after that run ends. Configuration errors disable the offending task
    /// and never abort the tick.
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        for row in self.enabled_tasks()? {
            let trigger: Trigger = match serde_json::from_str(&row.trigger_raw) {
                Ok(t) => t,
                Err(e) => {
                    disable_with_error(&self.conn, &row.id, &format!("unreadable trigger: {e}"), now)?;
                    report.disabled += 1;
                    continue;
                }
            };

            let (next, next_raw) = match row.next_fire_raw.as_deref() {
                Some(raw) => match parse_ts(raw) {
                    Some(next) => (next, raw.to_string()),
                    None => {
                        warn!(task = %row.name, next_fire_at = raw, "unreadable next_fire_at");
                        let reason = format!("unreadable next_fire_at {raw:?}");
                        disable_with_error(&self.conn, &row.id, &reason, now)?;
                        report.disabled += 1;
                        continue;
                    }
                },
                None => match trigger::first_fire(&trigger, &row.timezone, now) {
                    Ok(first) => {
                        let first_raw = fmt_ts(first);
                        self.conn.execute(
                            "UPDATE tasks SET next_fire_at = ?1, updated_at = ?2
                             WHERE id = ?3 AND next_fire_at IS NULL",
                            params![first_raw, fmt_ts(now), row.id.as_str()],
                        )?;
                        debug!(task = %row.name, next_fire_at = %first, "task scheduled");
                        report.scheduled += 1;
                        (first, first_raw)
                    }
                    Err(e) => {
                        disable_with_error(&self.conn, &row.id, &e.to_string(), now)?;
                        report.disabled += 1;
                        continue;
                    }
                },
            };

            if now < next {
                continue;
            }

            if self.fire(&row, &trigger, &next_raw, now)? {
                report.fired += 1;
            } else {
                report.busy += 1;
            }
        }

        if report != TickReport::default() {
            debug!(?report, "tick");
        }
        Ok(report)
    }

    /// Enqueue a run for a due task and advance its schedule, atomically.
    ///
    /// Returns `false` when the task still has an active run. `due_raw` is the
    /// stored `next_fire_at` text the schedule update compares against.
    fn fire(
        &mut self,
        row: &DueRow,
        trigger: &Trigger,
        due_raw: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let tx = self.conn.transaction()?;

        let Some(run_id) = insert_if_idle(&tx, &row.id, RunSource::Schedule, now)? else {
            debug!(task = %row.name, "due but a run is still active; holding");
            return Ok(false);
        };

        let (enabled, next) = match trigger::next_after(trigger, &row.timezone, now) {
            Ok(Some(next)) => (true, Some(next)),
            // Deadline: one fire, then terminal.
            Ok(None) => (false, None),
            Err(e) => {
                // The run stays queued; the task stops here.
                error!(task = %row.name, "cannot compute next fire: {e}");
                disable_with_error(&tx, &row.id, &e.to_string(), now)?;
                tx.commit()?;
                return Ok(true);
            }
        };

        let updated = tx.execute(
            "UPDATE tasks SET next_fire_at = ?1, enabled = ?2, updated_at = ?3
             WHERE id = ?4 AND next_fire_at = ?5",
            params![
                next.map(fmt_ts),
                enabled,
                fmt_ts(now),
                row.id.as_str(),
                due_raw,
            ],
        )?;
        if updated == 0 {
            // Someone rescheduled or disabled the task mid-tick; drop the run.
            debug!(task = %row.name, "task changed under the tick; not firing");
            return Ok(false);
        }
        tx.commit()?;

        info!(
            task = %row.name,
            run_id = %run_id,
            next_fire_at = ?next,
            "task fired"
        );
        Ok(true)
    }

    fn enabled_tasks(&self) -> Result<Vec<DueRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, name, trigger_spec, timezone, next_fire_at
             FROM tasks WHERE enabled = 1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DueRow {
                    id: TaskId(row.get(0)?),
                    name: row.get(1)?,
                    trigger_raw: row.get(2)?,
                    timezone: row.get(3)?,
                    next_fire_raw: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Main event loop. Ticks every `tick_secs` until `shutdown` broadcasts `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = self.tick_secs, "trigger engine started");

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(self.tick_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        error!("trigger tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("trigger engine shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{RunCompletion, RunQueue};
    use crate::store::{NewTask, TaskStore};
    use chrono::{Duration, TimeZone};
    use everping_core::RunStatus;

    /// Engine, store and queue on one file so they see each other's writes.
    struct Fixture {
        _dir: tempfile::TempDir,
        engine: TriggerEngine,
        store: TaskStore,
        queue: RunQueue,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("everping.db");
        let engine = TriggerEngine::new(
            crate::db::open(&path).unwrap(),
            &SchedulerConfig::default(),
        )
        .unwrap();
        let store = TaskStore::new(crate::db::open(&path).unwrap()).unwrap();
        let queue = RunQueue::new(crate::db::open(&path).unwrap()).unwrap();
        Fixture {
            _dir: dir,
            engine,
            store,
            queue,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn add(f: &Fixture, name: &str, trigger: Trigger) -> TaskId {
        f.store
            .add_task(NewTask {
                name: name.into(),
                job_id: "echo".into(),
                trigger,
                timezone: "UTC".into(),
                enabled: true,
                timeout_secs: None,
            })
            .unwrap()
            .id
    }

    fn finish(queue: &RunQueue, run: everping_core::RunId, at: DateTime<Utc>) {
        queue
            .finish(
                run,
                RunCompletion {
                    status: RunStatus::Success,
                    finished_at: at,
                    exit_code: Some(0),
                    log_path: None,
                    error: None,
                },
            )
            .unwrap();
    }

    #[test]
    fn first_tick_only_schedules() {
        let mut f = fixture();
        let id = add(&f, "ping", Trigger::Interval { every_secs: 5 });

        let report = f.engine.tick_at(t0()).unwrap();
        assert_eq!(report.scheduled, 1);
        assert_eq!(report.fired, 0);
        let task = f.store.get_task(&id).unwrap().unwrap();
        assert_eq!(task.next_fire_at, Some(t0() + Duration::seconds(5)));
    }

    #[test]
    fn slow_run_never_overlaps() {
        // Interval 5s, the first run takes 20s: ticks every second through
        // t=30 must produce exactly two runs, the second one right after the
        // first finishes.
        let mut f = fixture();
        let id = add(&f, "slow", Trigger::Interval { every_secs: 5 });

        let mut claimed = None;
        for s in 0..=30 {
            let now = t0() + Duration::seconds(s);
            if s == 25 {
                let run = claimed.take().unwrap();
                finish(&f.queue, run, now);
            }
            f.engine.tick_at(now).unwrap();
            if claimed.is_none() && s < 25 {
                if let Some(run) = f.queue.claim_next(now).unwrap() {
                    claimed = Some(run.id);
                }
            }
            let active = f
                .queue
                .recent_runs(Some(&id), 100)
                .unwrap()
                .iter()
                .filter(|r| r.status.is_active())
                .count();
            assert!(active <= 1, "two active runs at t+{s}");
        }

        let runs = f.queue.recent_runs(Some(&id), 100).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].created_at, t0() + Duration::seconds(5));
        assert_eq!(runs[0].created_at, t0() + Duration::seconds(25));
    }

    #[test]
    fn deadline_fires_once_then_disables() {
        let mut f = fixture();
        let id = add(
            &f,
            "once",
            Trigger::Deadline {
                at: "2026-03-01T09:00:10".into(),
            },
        );

        for s in 0..=60 {
            let now = t0() + Duration::seconds(s);
            f.engine.tick_at(now).unwrap();
            if let Some(run) = f.queue.claim_next(now).unwrap() {
                finish(&f.queue, run.id, now);
            }
        }

        let runs = f.queue.recent_runs(Some(&id), 100).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].created_at, t0() + Duration::seconds(10));
        let task = f.store.get_task(&id).unwrap().unwrap();
        assert!(!task.enabled);
        assert!(task.next_fire_at.is_none());
        assert!(task.last_error.is_none());
    }

    #[test]
    fn missed_deadline_fires_on_first_tick() {
        let mut f = fixture();
        let id = add(
            &f,
            "late",
            Trigger::Deadline {
                at: "2026-03-01T08:00:00".into(),
            },
        );
        let report = f.engine.tick_at(t0()).unwrap();
        assert_eq!(report.fired, 1);
        assert_eq!(f.queue.recent_runs(Some(&id), 10).unwrap().len(), 1);
    }

    #[test]
    fn broken_task_is_disabled_and_others_continue() {
        let mut f = fixture();
        let good = add(&f, "good", Trigger::Interval { every_secs: 1 });
        let bad = add(&f, "bad", Trigger::Interval { every_secs: 1 });
        // Corrupt the stored timezone behind the store's back.
        f.engine
            .conn
            .execute(
                "UPDATE tasks SET timezone = 'Nowhere/Land' WHERE id = ?1",
                [bad.as_str()],
            )
            .unwrap();

        let report = f.engine.tick_at(t0()).unwrap();
        assert_eq!(report.disabled, 1);
        assert_eq!(report.scheduled, 1);

        let bad_task = f.store.get_task(&bad).unwrap().unwrap();
        assert!(!bad_task.enabled);
        assert!(bad_task.last_error.unwrap().contains("Nowhere/Land"));

        f.engine.tick_at(t0() + Duration::seconds(1)).unwrap();
        assert_eq!(f.queue.recent_runs(Some(&good), 10).unwrap().len(), 1);
    }

    #[test]
    fn unreadable_next_fire_disables_only_that_task() {
        let mut f = fixture();
        let good = add(&f, "good", Trigger::Interval { every_secs: 1 });
        let bad = add(&f, "bad", Trigger::Interval { every_secs: 1 });
        f.engine.tick_at(t0()).unwrap();
        f.engine
            .conn
            .execute(
                "UPDATE tasks SET next_fire_at = '2026-03-01 09:00:00' WHERE id = ?1",
                [bad.as_str()],
            )
            .unwrap();

        let report = f.engine.tick_at(t0() + Duration::seconds(1)).unwrap();
        assert_eq!(report.disabled, 1);
        assert_eq!(report.fired, 1);
        assert_eq!(f.queue.recent_runs(Some(&good), 10).unwrap().len(), 1);

        let bad_task = f.store.get_task(&bad).unwrap().unwrap();
        assert!(!bad_task.enabled);
        assert!(bad_task.last_error.unwrap().contains("next_fire_at"));
        assert!(f.engine.tick_at(t0() + Duration::seconds(2)).is_ok());
    }

    #[test]
    fn hand_edited_rfc3339_next_fire_still_fires() {
        let mut f = fixture();
        let id = add(&f, "edited", Trigger::Interval { every_secs: 60 });
        f.engine
            .conn
            .execute(
                "UPDATE tasks SET next_fire_at = '2026-03-01T10:00:00+01:00' WHERE id = ?1",
                [id.as_str()],
            )
            .unwrap();

        let report = f.engine.tick_at(t0()).unwrap();
        assert_eq!(report.fired, 1);
        let task = f.store.get_task(&id).unwrap().unwrap();
        assert_eq!(task.next_fire_at, Some(t0() + Duration::seconds(60)));
    }

    #[test]
    fn disabled_tasks_are_ignored() {
        let mut f = fixture();
        let id = add(&f, "off", Trigger::Interval { every_secs: 1 });
        f.store.set_enabled("off", false).unwrap();
        for s in 0..5 {
            f.engine.tick_at(t0() + Duration::seconds(s)).unwrap();
        }
        assert!(f.queue.recent_runs(Some(&id), 10).unwrap().is_empty());
    }

    #[test]
    fn manual_run_holds_the_schedule() {
        let mut f = fixture();
        let id = add(&f, "ping", Trigger::Interval { every_secs: 5 });
        f.engine.tick_at(t0()).unwrap();
        f.queue
            .enqueue(&id, RunSource::Manual, t0() + Duration::seconds(1))
            .unwrap()
            .unwrap();

        let report = f.engine.tick_at(t0() + Duration::seconds(5)).unwrap();
        assert_eq!(report.busy, 1);
        assert_eq!(report.fired, 0);
    }
}
