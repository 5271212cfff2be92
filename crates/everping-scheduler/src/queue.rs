//! The persisted run queue and its claim protocol.
//!
//! A run moves `PENDING -> RUNNING` only through [`RunQueue::try_claim`], a
//! compare-and-set on `status = 'PENDING'`, and `RUNNING -> terminal` only
//! through [`RunQueue::finish`], a compare-and-set on `status = 'RUNNING'`.
//! Those two statements are the only writes to a run after it is created, so
//! any number of workers (in any number of processes) can share the table.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use everping_core::config::WorkerConfig;
use everping_core::time::{fmt_ts, parse_ts};
use everping_core::{Run, RunId, RunSource, RunStatus, TaskId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::{
    db::{bad_text, init_db, lock, opt_ts_col, ts_col},
    error::{Result, SchedulerError},
};

/// Candidates fetched per claim attempt.
const CLAIM_BATCH: usize = 8;
/// Fresh batches tried before reporting an empty queue.
const CLAIM_ROUNDS: usize = 3;

const RUN_COLUMNS: &str = "id, task_id, status, source, created_at, claimed_at, finished_at, \
     exit_code, log_path, error";

/// Margin past a run's own timeout and kill grace before it counts as a zombie.
const REAP_SLACK_SECS: i64 = 60;

/// How long a run may stay `RUNNING` before the sweep fails it.
///
/// The executor kills a run after its timeout plus the kill grace, so a run
/// still `RUNNING` well past that has lost its worker. `min_age` only raises
/// the limit; it never cuts a run short of its own timeout.
#[derive(Debug, Clone, Copy)]
pub struct ZombiePolicy {
    pub min_age: Duration,
    pub default_timeout: Duration,
    pub kill_grace: Duration,
}

impl ZombiePolicy {
    pub fn from_config(worker: &WorkerConfig) -> Self {
        Self {
            min_age: secs(worker.zombie_secs),
            default_timeout: secs(worker.default_timeout_secs),
            kill_grace: secs(worker.kill_grace_secs),
        }
    }

    /// Age past which a run of a task with `timeout_secs` is a zombie.
    pub fn age_limit(&self, timeout_secs: Option<u64>) -> Duration {
        let timeout = timeout_secs.map(secs).unwrap_or(self.default_timeout);
        let budget = timeout + self.kill_grace + Duration::seconds(REAP_SLACK_SECS);
        self.min_age.max(budget)
    }
}

fn secs(s: u64) -> Duration {
    Duration::seconds(s.min(u64::from(u32::MAX)) as i64)
}

/// Terminal state recorded by [`RunQueue::finish`].
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub log_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct RunQueue {
    conn: Arc<Mutex<Connection>>,
}

impl RunQueue {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Queue a run unless the task already has an active one.
    ///
    /// Returns `None` when a `PENDING` or `RUNNING` run exists; the check and
    /// the insert are one statement.
    pub fn enqueue(
        &self,
        task_id: &TaskId,
        source: RunSource,
        now: DateTime<Utc>,
    ) -> Result<Option<RunId>> {
        let conn = lock(&self.conn);
        let id = insert_if_idle(&conn, task_id, source, now)?;
        match id {
            Some(id) => info!(run_id = %id, %task_id, source = source.as_str(), "run enqueued"),
            None => debug!(%task_id, "enqueue skipped: task has an active run"),
        }
        Ok(id)
    }

    /// Claim the oldest claimable run, FIFO on `(created_at, id)`.
    ///
    /// Losing a race on one candidate moves on to the next; `None` means the
    /// queue is empty (or every candidate was taken by someone else).
    pub fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Run>> {
        for _ in 0..CLAIM_ROUNDS {
            let candidates = self.pending_ids(CLAIM_BATCH)?;
            if candidates.is_empty() {
                return Ok(None);
            }
            for id in candidates {
                match self.try_claim(id, now) {
                    Ok(run) => return Ok(Some(run)),
                    Err(SchedulerError::ClaimConflict { run_id }) => {
                        debug!(run_id, "claim lost, trying next candidate");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(None)
    }

    /// Atomically move run `id` from `PENDING` to `RUNNING`.
    pub fn try_claim(&self, id: RunId, now: DateTime<Utc>) -> Result<Run> {
        let conn = lock(&self.conn);
        let n = conn.execute(
            "UPDATE runs SET status = 'RUNNING', claimed_at = ?1
             WHERE id = ?2 AND status = 'PENDING'",
            params![fmt_ts(now), id.0],
        )?;
        if n == 0 {
            return Err(SchedulerError::ClaimConflict { run_id: id.0 });
        }
        get_run(&conn, id)?.ok_or_else(|| SchedulerError::Corrupt(format!("run {id} vanished after claim")))
    }

    /// Record the terminal state of a `RUNNING` run.
    ///
    /// Returns `false` if the run was not `RUNNING` (already finished, reaped
    /// as a zombie, or never claimed); the stored row is left untouched.
    pub fn finish(&self, id: RunId, completion: RunCompletion) -> Result<bool> {
        if completion.status.is_active() {
            return Err(SchedulerError::InvalidTransition {
                run_id: id.0,
                status: completion.status.to_string(),
            });
        }
        let conn = lock(&self.conn);
        let n = conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, exit_code = ?3, log_path = ?4, error = ?5
             WHERE id = ?6 AND status = 'RUNNING'",
            params![
                completion.status.as_str(),
                fmt_ts(completion.finished_at),
                completion.exit_code,
                completion.log_path,
                completion.error,
                id.0,
            ],
        )?;
        if n == 0 {
            warn!(run_id = %id, status = %completion.status, "finish ignored: run is not RUNNING");
            return Ok(false);
        }
        Ok(true)
    }

    pub fn get_run(&self, id: RunId) -> Result<Option<Run>> {
        let conn = lock(&self.conn);
        get_run(&conn, id)
    }

    /// Newest first, optionally for a single task.
    pub fn recent_runs(&self, task_id: Option<&TaskId>, limit: usize) -> Result<Vec<Run>> {
        let conn = lock(&self.conn);
        let limit = limit as i64;
        let runs = match task_id {
            Some(task_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE task_id = ?1 ORDER BY id DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![task_id.as_str(), limit], run_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs ORDER BY id DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map([limit], run_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(runs)
    }

    pub fn has_active(&self, task_id: &TaskId) -> Result<bool> {
        let conn = lock(&self.conn);
        has_active(&conn, task_id)
    }

    pub fn pending_count(&self) -> Result<usize> {
        let conn = lock(&self.conn);
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE status = 'PENDING'",
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Fail every `RUNNING` run. Call once at startup, before any worker
    /// claims: whatever was running belonged to a previous process.
    pub fn recover_orphans(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = lock(&self.conn);
        let n = conn.execute(
            "UPDATE runs SET status = 'FAILED', finished_at = ?1,
                    error = 'orphaned by daemon restart'
             WHERE status = 'RUNNING'",
            [fmt_ts(now)],
        )?;
        if n > 0 {
            warn!(count = n, "orphaned runs failed on startup");
        }
        Ok(n)
    }

    /// Fail runs that have been `RUNNING` past their [`ZombiePolicy::age_limit`].
    ///
    /// The limit is per run, from its task's timeout; runs of deleted tasks
    /// use the default timeout.
    pub fn reap_zombies(&self, now: DateTime<Utc>, policy: &ZombiePolicy) -> Result<usize> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let running = {
            let mut stmt = tx.prepare(
                "SELECT r.id, r.claimed_at, t.timeout_secs FROM runs r
                 LEFT JOIN tasks t ON t.id = r.task_id
                 WHERE r.status = 'RUNNING' AND r.claimed_at IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    RunId(row.get(0)?),
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut reaped = 0;
        for (id, claimed_raw, timeout_secs) in running {
            let Some(claimed_at) = parse_ts(&claimed_raw) else {
                warn!(run_id = %id, claimed_at = %claimed_raw, "unreadable claim time, not reaping");
                continue;
            };
            let limit = policy.age_limit(timeout_secs.map(|s| s.max(0) as u64));
            if now - claimed_at <= limit {
                continue;
            }
            reaped += tx.execute(
                "UPDATE runs SET status = 'FAILED', finished_at = ?1,
                        error = 'zombie run auto-failed'
                 WHERE id = ?2 AND status = 'RUNNING'",
                params![fmt_ts(now), id.0],
            )?;
            warn!(run_id = %id, limit_secs = limit.num_seconds(), "zombie run failed");
        }
        tx.commit()?;
        Ok(reaped)
    }

    /// Delete finished runs. `PENDING` and `RUNNING` rows are kept: the
    /// one-active-run check and the claim protocol depend on them.
    pub fn clear_finished(&self) -> Result<usize> {
        let conn = lock(&self.conn);
        let n = conn.execute(
            "DELETE FROM runs WHERE status NOT IN ('PENDING', 'RUNNING')",
            [],
        )?;
        info!(removed = n, "finished runs cleared");
        Ok(n)
    }

    fn pending_ids(&self, limit: usize) -> Result<Vec<RunId>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM runs WHERE status = 'PENDING' ORDER BY created_at, id LIMIT ?1",
        )?;
        let ids = stmt
            .query_map([limit as i64], |r| r.get(0).map(RunId))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}

/// Insert a `PENDING` run for `task_id` unless it already has an active run.
///
/// Shared by manual enqueues and the trigger engine's tick transaction.
pub(crate) fn insert_if_idle(
    conn: &Connection,
    task_id: &TaskId,
    source: RunSource,
    now: DateTime<Utc>,
) -> Result<Option<RunId>> {
    let n = conn.execute(
        "INSERT INTO runs (task_id, status, source, created_at)
         SELECT ?1, 'PENDING', ?2, ?3
         WHERE NOT EXISTS (
             SELECT 1 FROM runs WHERE task_id = ?1 AND status IN ('PENDING', 'RUNNING')
         )",
        params![task_id.as_str(), source.as_str(), fmt_ts(now)],
    )?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(RunId(conn.last_insert_rowid())))
}

pub(crate) fn has_active(conn: &Connection, task_id: &TaskId) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM runs WHERE task_id = ?1 AND status IN ('PENDING', 'RUNNING') LIMIT 1",
            [task_id.as_str()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn get_run(conn: &Connection, id: RunId) -> Result<Option<Run>> {
    let run = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            [id.0],
            run_from_row,
        )
        .optional()?;
    Ok(run)
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status_raw: String = row.get(2)?;
    let source_raw: String = row.get(3)?;
    Ok(Run {
        id: RunId(row.get(0)?),
        task_id: TaskId(row.get(1)?),
        status: status_raw.parse().map_err(|_| bad_text(2, &status_raw))?,
        source: source_raw.parse().map_err(|_| bad_text(3, &source_raw))?,
        created_at: ts_col(row, 4)?,
        claimed_at: opt_ts_col(row, 5)?,
        finished_at: opt_ts_col(row, 6)?,
        exit_code: row.get(7)?,
        log_path: row.get(8)?,
        error: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn queue() -> RunQueue {
        RunQueue::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn done(status: RunStatus, at: DateTime<Utc>) -> RunCompletion {
        RunCompletion {
            status,
            finished_at: at,
            exit_code: Some(0),
            log_path: None,
            error: None,
        }
    }

    #[test]
    fn one_active_run_per_task() {
        let q = queue();
        let task = TaskId::from("a");
        let first = q.enqueue(&task, RunSource::Manual, t0()).unwrap();
        assert!(first.is_some());
        assert!(q.enqueue(&task, RunSource::Schedule, t0()).unwrap().is_none());
        assert!(q.has_active(&task).unwrap());

        let other = TaskId::from("b");
        assert!(q.enqueue(&other, RunSource::Manual, t0()).unwrap().is_some());
        assert_eq!(q.pending_count().unwrap(), 2);
    }

    #[test]
    fn claims_in_fifo_order() {
        let q = queue();
        let later = q
            .enqueue(&TaskId::from("late"), RunSource::Manual, t0() + Duration::seconds(5))
            .unwrap()
            .unwrap();
        let early = q
            .enqueue(&TaskId::from("early"), RunSource::Manual, t0())
            .unwrap()
            .unwrap();

        let first = q.claim_next(t0() + Duration::seconds(6)).unwrap().unwrap();
        assert_eq!(first.id, early);
        assert_eq!(first.status, RunStatus::Running);
        assert!(first.claimed_at.is_some());
        let second = q.claim_next(t0() + Duration::seconds(6)).unwrap().unwrap();
        assert_eq!(second.id, later);
        assert!(q.claim_next(t0() + Duration::seconds(6)).unwrap().is_none());
    }

    #[test]
    fn second_claim_conflicts() {
        let q = queue();
        let id = q
            .enqueue(&TaskId::from("a"), RunSource::Manual, t0())
            .unwrap()
            .unwrap();
        q.try_claim(id, t0()).unwrap();
        assert!(matches!(
            q.try_claim(id, t0()),
            Err(SchedulerError::ClaimConflict { .. })
        ));
    }

    #[test]
    fn terminal_runs_are_immutable() {
        let q = queue();
        let task = TaskId::from("a");
        let id = q.enqueue(&task, RunSource::Manual, t0()).unwrap().unwrap();
        q.try_claim(id, t0()).unwrap();

        assert!(q.finish(id, done(RunStatus::Success, t0())).unwrap());
        assert!(!q.finish(id, done(RunStatus::Failed, t0())).unwrap());
        assert_eq!(q.get_run(id).unwrap().unwrap().status, RunStatus::Success);
        assert!(!q.has_active(&task).unwrap());

        // A finished task can be queued again.
        assert!(q.enqueue(&task, RunSource::Manual, t0()).unwrap().is_some());
    }

    #[test]
    fn finish_rejects_active_status() {
        let q = queue();
        let id = q
            .enqueue(&TaskId::from("a"), RunSource::Manual, t0())
            .unwrap()
            .unwrap();
        assert!(matches!(
            q.finish(id, done(RunStatus::Pending, t0())),
            Err(SchedulerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn finish_requires_a_claim() {
        let q = queue();
        let id = q
            .enqueue(&TaskId::from("a"), RunSource::Manual, t0())
            .unwrap()
            .unwrap();
        assert!(!q.finish(id, done(RunStatus::Success, t0())).unwrap());
        assert_eq!(q.get_run(id).unwrap().unwrap().status, RunStatus::Pending);
    }

    fn policy(min_age_mins: i64) -> ZombiePolicy {
        ZombiePolicy {
            min_age: Duration::minutes(min_age_mins),
            default_timeout: Duration::seconds(60),
            kill_grace: Duration::seconds(5),
        }
    }

    #[test]
    fn zombies_and_orphans_are_failed() {
        let q = queue();
        let old = q
            .enqueue(&TaskId::from("old"), RunSource::Manual, t0())
            .unwrap()
            .unwrap();
        let fresh = q
            .enqueue(&TaskId::from("fresh"), RunSource::Manual, t0())
            .unwrap()
            .unwrap();
        q.try_claim(old, t0()).unwrap();
        q.try_claim(fresh, t0() + Duration::minutes(59)).unwrap();

        let now = t0() + Duration::minutes(61);
        assert_eq!(q.reap_zombies(now, &policy(60)).unwrap(), 1);
        let reaped = q.get_run(old).unwrap().unwrap();
        assert_eq!(reaped.status, RunStatus::Failed);
        assert_eq!(reaped.error.as_deref(), Some("zombie run auto-failed"));
        assert_eq!(q.get_run(fresh).unwrap().unwrap().status, RunStatus::Running);

        assert_eq!(q.recover_orphans(now).unwrap(), 1);
        assert_eq!(q.get_run(fresh).unwrap().unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn age_limit_covers_the_task_timeout() {
        let p = policy(60);
        assert_eq!(p.age_limit(None), Duration::minutes(60));
        assert_eq!(p.age_limit(Some(600)), Duration::minutes(60));
        assert_eq!(p.age_limit(Some(7200)), Duration::seconds(7200 + 5 + 60));
    }

    #[test]
    fn long_timeout_run_is_not_reaped_early() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        conn.execute(
            "INSERT INTO tasks (id, name, job_id, trigger_spec, timezone, timeout_secs, created_at, updated_at)
             VALUES ('slow', 'slow', 'j', '{}', 'UTC', 7200, ?1, ?1)",
            [fmt_ts(t0())],
        )
        .unwrap();
        let q = RunQueue::new(conn).unwrap();
        let task = TaskId::from("slow");
        let id = q.enqueue(&task, RunSource::Manual, t0()).unwrap().unwrap();
        q.try_claim(id, t0()).unwrap();

        // Past the global zombie age but inside the task's own timeout.
        let now = t0() + Duration::minutes(61);
        assert_eq!(q.reap_zombies(now, &policy(60)).unwrap(), 0);
        assert!(q.enqueue(&task, RunSource::Schedule, now).unwrap().is_none());

        let later = t0() + Duration::seconds(7200 + 5 + 61);
        assert_eq!(q.reap_zombies(later, &policy(60)).unwrap(), 1);
        assert!(q.enqueue(&task, RunSource::Schedule, later).unwrap().is_some());
    }

    #[test]
    fn clear_keeps_active_runs() {
        let q = queue();
        let done_id = q.enqueue(&TaskId::from("a"), RunSource::Manual, t0()).unwrap().unwrap();
        q.try_claim(done_id, t0()).unwrap();
        q.finish(done_id, done(RunStatus::Failed, t0())).unwrap();
        let running = q.enqueue(&TaskId::from("b"), RunSource::Manual, t0()).unwrap().unwrap();
        q.try_claim(running, t0()).unwrap();
        let pending = q.enqueue(&TaskId::from("c"), RunSource::Manual, t0()).unwrap().unwrap();

        assert_eq!(q.clear_finished().unwrap(), 1);
        assert!(q.get_run(done_id).unwrap().is_none());
        assert_eq!(q.get_run(running).unwrap().unwrap().status, RunStatus::Running);
        assert_eq!(q.get_run(pending).unwrap().unwrap().status, RunStatus::Pending);
        assert!(q.enqueue(&TaskId::from("b"), RunSource::Manual, t0()).unwrap().is_none());
    }

    #[test]
    fn recent_runs_filters_by_task() {
        let q = queue();
        let a = TaskId::from("a");
        for i in 0..3 {
            let id = q
                .enqueue(&a, RunSource::Manual, t0() + Duration::seconds(i))
                .unwrap()
                .unwrap();
            q.try_claim(id, t0()).unwrap();
            q.finish(id, done(RunStatus::Success, t0())).unwrap();
        }
        q.enqueue(&TaskId::from("b"), RunSource::Manual, t0()).unwrap();

        let runs = q.recent_runs(Some(&a), 2).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].id > runs[1].id);
        assert_eq!(q.recent_runs(None, 10).unwrap().len(), 4);
    }
}
