use rusqlite::{Connection, Result};

/// Initialise the metrics table. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metrics (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            task_name  TEXT NOT NULL,
            key        TEXT NOT NULL,
            value      REAL NOT NULL,
            ts         TEXT NOT NULL
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_metrics_series
            ON metrics(task_name, key, ts);
        CREATE INDEX IF NOT EXISTS idx_metrics_ts
            ON metrics(ts);",
    )
}
