use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use everping_core::{time::fmt_ts, Task, TaskId, Trigger};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};

use crate::{
    db::{bad_text, init_db, lock, opt_ts_col, ts_col},
    error::{Result, SchedulerError},
    trigger,
};

pub(crate) const TASK_COLUMNS: &str = "id, name, job_id, trigger_spec, timezone, enabled, \
     timeout_secs, next_fire_at, last_error, created_at, updated_at";

/// Fields an operator supplies for a task; everything else is derived.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub job_id: String,
    pub trigger: Trigger,
    pub timezone: String,
    pub enabled: bool,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Operator-facing task management (add/sync/list/enable/remove).
///
/// Uses its own `Connection` so the CLI and the daemon's config sync never
/// contend with the trigger engine's tick transaction.
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a new task. The trigger and timezone are validated up front so a
    /// bad definition is refused here rather than disabled later by the engine.
    pub fn add_task(&self, new: NewTask) -> Result<Task> {
        trigger::validate(&new.trigger, &new.timezone)?;
        let conn = lock(&self.conn);
        if find_by_name(&conn, &new.name)?.is_some() {
            return Err(SchedulerError::DuplicateTask(new.name));
        }
        let task = insert(&conn, new, Utc::now())?;
        info!(task = %task.name, task_id = %task.id, trigger = %task.trigger, "task added");
        Ok(task)
    }

    /// Create or update the task called `new.name`.
    ///
    /// A changed definition (job, trigger, timezone, timeout) clears
    /// `next_fire_at` and `last_error` so the engine re-evaluates it. When the
    /// definition is unchanged, `enabled = false` always applies but
    /// `enabled = true` does not revive a task that failed validation or a
    /// deadline that already fired.
    pub fn upsert_task(&self, new: NewTask) -> Result<(Task, SyncOutcome)> {
        trigger::validate(&new.trigger, &new.timezone)?;
        let now = Utc::now();
        let conn = lock(&self.conn);
        let Some(existing) = find_by_name(&conn, &new.name)? else {
            let task = insert(&conn, new, now)?;
            info!(task = %task.name, task_id = %task.id, "task created from config");
            return Ok((task, SyncOutcome::Created));
        };

        let definition_changed = existing.job_id != new.job_id
            || existing.trigger != new.trigger
            || existing.timezone != new.timezone
            || existing.timeout_secs != new.timeout_secs;

        if definition_changed {
            conn.execute(
                "UPDATE tasks SET job_id = ?1, trigger_spec = ?2, timezone = ?3, timeout_secs = ?4,
                        enabled = ?5, next_fire_at = NULL, last_error = NULL, updated_at = ?6
                 WHERE id = ?7",
                params![
                    new.job_id,
                    trigger_json(&new.trigger)?,
                    new.timezone,
                    new.timeout_secs.map(|s| s as i64),
                    new.enabled,
                    fmt_ts(now),
                    existing.id.as_str(),
                ],
            )?;
            info!(task = %new.name, "task definition updated from config");
        } else {
            let enabled = if new.enabled && !existing.enabled {
                existing.last_error.is_none() && !spent_deadline(&existing, now)
            } else {
                new.enabled
            };
            if enabled == existing.enabled {
                return Ok((existing, SyncOutcome::Unchanged));
            }
            conn.execute(
                "UPDATE tasks SET enabled = ?1, next_fire_at = NULL, updated_at = ?2 WHERE id = ?3",
                params![enabled, fmt_ts(now), existing.id.as_str()],
            )?;
            info!(task = %new.name, enabled, "task enablement synced from config");
        }

        let task = get_by_id(&conn, &existing.id)?
            .ok_or_else(|| SchedulerError::TaskNotFound(new.name.clone()))?;
        Ok((task, SyncOutcome::Updated))
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        let conn = lock(&self.conn);
        get_by_id(&conn, id)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<Task>> {
        let conn = lock(&self.conn);
        find_by_name(&conn, name)
    }

    /// All tasks ordered by name.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY name"))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Enable or disable a task by name. Enabling clears `last_error` and
    /// `next_fire_at`, so the next tick recomputes the schedule from scratch.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<Task> {
        let conn = lock(&self.conn);
        let now = fmt_ts(Utc::now());
        let n = if enabled {
            conn.execute(
                "UPDATE tasks SET enabled = 1, next_fire_at = NULL, last_error = NULL, updated_at = ?1
                 WHERE name = ?2",
                params![now, name],
            )?
        } else {
            conn.execute(
                "UPDATE tasks SET enabled = 0, next_fire_at = NULL, updated_at = ?1 WHERE name = ?2",
                params![now, name],
            )?
        };
        if n == 0 {
            return Err(SchedulerError::TaskNotFound(name.to_string()));
        }
        info!(task = %name, enabled, "task enablement changed");
        find_by_name(&conn, name)?.ok_or_else(|| SchedulerError::TaskNotFound(name.to_string()))
    }

    /// Disable a task because its configuration cannot be evaluated.
    pub fn disable_with_error(&self, id: &TaskId, error: &str) -> Result<()> {
        let conn = lock(&self.conn);
        disable_with_error(&conn, id, error, Utc::now())
    }

    /// Delete a task by name. Its historical runs stay in the run table.
    pub fn remove_task(&self, name: &str) -> Result<()> {
        let conn = lock(&self.conn);
        let n = conn.execute("DELETE FROM tasks WHERE name = ?1", [name])?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound(name.to_string()));
        }
        info!(task = %name, "task removed");
        Ok(())
    }
}

fn insert(conn: &Connection, new: NewTask, now: DateTime<Utc>) -> Result<Task> {
    let id = TaskId::new();
    let now_str = fmt_ts(now);
    conn.execute(
        "INSERT INTO tasks
         (id, name, job_id, trigger_spec, timezone, enabled, timeout_secs,
          next_fire_at, last_error, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,NULL,NULL,?8,?8)",
        params![
            id.as_str(),
            new.name,
            new.job_id,
            trigger_json(&new.trigger)?,
            new.timezone,
            new.enabled,
            new.timeout_secs.map(|s| s as i64),
            now_str,
        ],
    )?;
    Ok(Task {
        id,
        name: new.name,
        job_id: new.job_id,
        trigger: new.trigger,
        timezone: new.timezone,
        enabled: new.enabled,
        timeout_secs: new.timeout_secs,
        next_fire_at: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    })
}

pub(crate) fn disable_with_error(
    conn: &Connection,
    id: &TaskId,
    error: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let n = conn.execute(
        "UPDATE tasks SET enabled = 0, next_fire_at = NULL, last_error = ?1, updated_at = ?2
         WHERE id = ?3",
        params![error, fmt_ts(now), id.as_str()],
    )?;
    if n == 0 {
        return Err(SchedulerError::TaskNotFound(id.to_string()));
    }
    warn!(task_id = %id, %error, "task disabled: configuration error");
    Ok(())
}

pub(crate) fn get_by_id(conn: &Connection, id: &TaskId) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            [id.as_str()],
            task_from_row,
        )
        .optional()?;
    Ok(task)
}

fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE name = ?1"),
            [name],
            task_from_row,
        )
        .optional()?;
    Ok(task)
}

/// Row mapper for `SELECT {TASK_COLUMNS}`.
pub(crate) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let trigger_raw: String = row.get(3)?;
    let trigger: Trigger =
        serde_json::from_str(&trigger_raw).map_err(|_| bad_text(3, &trigger_raw))?;
    Ok(Task {
        id: TaskId(row.get(0)?),
        name: row.get(1)?,
        job_id: row.get(2)?,
        trigger,
        timezone: row.get(4)?,
        enabled: row.get(5)?,
        timeout_secs: row.get::<_, Option<i64>>(6)?.map(|s| s.max(0) as u64),
        next_fire_at: opt_ts_col(row, 7)?,
        last_error: row.get(8)?,
        created_at: ts_col(row, 9)?,
        updated_at: ts_col(row, 10)?,
    })
}

fn trigger_json(trigger: &Trigger) -> Result<String> {
    serde_json::to_string(trigger).map_err(|e| SchedulerError::InvalidTrigger(e.to_string()))
}

/// A disabled deadline task whose instant has passed has already fired.
fn spent_deadline(task: &Task, now: DateTime<Utc>) -> bool {
    let Trigger::Deadline { at } = &task.trigger else {
        return false;
    };
    trigger::parse_timezone(&task.timezone)
        .and_then(|tz| trigger::deadline_instant(at, &tz))
        .map(|instant| instant <= now)
        .unwrap_or(false)
}
