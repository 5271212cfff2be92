use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use everping_core::time::parse_ts;
use rusqlite::{types::Type, Connection, Row};

use crate::error::Result;

/// Open the shared database file with the settings every subsystem relies on.
///
/// Each subsystem calls this for its own connection; WAL lets the tick loop
/// read while a worker writes, and the busy timeout absorbs short write locks
/// instead of surfacing `SQLITE_BUSY`.
pub fn open(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `tasks` and `runs` tables (idempotent). The partial-status index
/// keeps the claim query and the active-run check cheap however long the run
/// history grows.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id            TEXT    NOT NULL PRIMARY KEY,
            name          TEXT    NOT NULL UNIQUE,
            job_id        TEXT    NOT NULL,
            trigger_spec  TEXT    NOT NULL,   -- JSON-encoded Trigger enum
            timezone      TEXT    NOT NULL,
            enabled       INTEGER NOT NULL DEFAULT 1,
            timeout_secs  INTEGER,
            next_fire_at  TEXT,               -- fixed-width UTC or NULL
            last_error    TEXT,
            created_at    TEXT    NOT NULL,
            updated_at    TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_tasks_enabled ON tasks (enabled, next_fire_at);

        CREATE TABLE IF NOT EXISTS runs (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id      TEXT    NOT NULL,    -- no FK: runs outlive deleted tasks
            status       TEXT    NOT NULL,
            source       TEXT    NOT NULL,
            created_at   TEXT    NOT NULL,
            claimed_at   TEXT,
            finished_at  TEXT,
            exit_code    INTEGER,
            log_path     TEXT,
            error        TEXT
        ) STRICT;

        -- FIFO claim: WHERE status = 'PENDING' ORDER BY created_at, id
        CREATE INDEX IF NOT EXISTS idx_runs_status ON runs (status, created_at, id);
        CREATE INDEX IF NOT EXISTS idx_runs_task ON runs (task_id, status);
        ",
    )?;
    Ok(())
}

/// Lock a shared connection. A poisoned lock only means another thread
/// panicked mid-statement; SQLite already rolled that statement back.
pub(crate) fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).ok_or_else(|| bad_text(idx, &raw))
}

pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => parse_ts(&raw).map(Some).ok_or_else(|| bad_text(idx, &raw)),
        None => Ok(None),
    }
}

pub(crate) fn bad_text(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected value {raw:?}").into(),
    )
}
