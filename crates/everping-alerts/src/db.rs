use rusqlite::{Connection, Result};

/// Initialise the alert tables. Safe to call on every startup (idempotent).
///
/// `alerts` holds one row per alert key (`{task}:{condition}`); the row
/// carries the suppression window, so de-duplication survives a daemon
/// restart. `alert_events` keeps every positive evaluation, pushed or not.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS alerts (
            key               TEXT    NOT NULL PRIMARY KEY,
            task_name         TEXT    NOT NULL,
            condition         TEXT    NOT NULL,
            message           TEXT    NOT NULL,
            severity          TEXT    NOT NULL,
            first_seen        TEXT    NOT NULL,
            last_seen         TEXT    NOT NULL,
            suppressed_until  TEXT    NOT NULL,
            fire_count        INTEGER NOT NULL DEFAULT 0,
            occurrences       INTEGER NOT NULL DEFAULT 0
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_alerts_last_seen ON alerts(last_seen DESC);

        CREATE TABLE IF NOT EXISTS alert_events (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            key         TEXT    NOT NULL,
            task_name   TEXT    NOT NULL,
            message     TEXT    NOT NULL,
            severity    TEXT    NOT NULL,
            at          TEXT    NOT NULL,
            suppressed  INTEGER NOT NULL
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_alert_events_key ON alert_events(key, id);",
    )
}
