use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use everping_core::{
    time::{fmt_ts, parse_ts},
    MetricSample,
};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::{
    db::init_db,
    error::{MetricsError, Result},
};

/// Persists metric samples per `(task_name, key)`.
///
/// Thread-safe: wraps its own SQLite connection in a Mutex. Writes for a
/// given task only ever come from the worker running that task's active run,
/// so appends never interleave within a series.
#[derive(Clone)]
pub struct MetricsStore {
    db: Arc<Mutex<Connection>>,
}

impl MetricsStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append all samples of one run in a single transaction.
    ///
    /// Either every sample is stored or none is; a non-finite value rejects
    /// the whole batch.
    pub fn append(&self, task_name: &str, samples: &[MetricSample]) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }
        if let Some(bad) = samples.iter().find(|s| !s.value.is_finite()) {
            return Err(MetricsError::InvalidSample {
                key: bad.key.clone(),
                value: bad.value,
                reason: "value is not finite",
            });
        }

        let mut db = self.lock();
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO metrics (task_name, key, value, ts) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for s in samples {
                stmt.execute(params![task_name, s.key, s.value, fmt_ts(s.ts)])?;
            }
        }
        tx.commit()?;
        debug!(task = %task_name, count = samples.len(), "metrics appended");
        Ok(samples.len())
    }

    /// Samples of one series, oldest first, optionally from `since` on.
    pub fn series(
        &self,
        task_name: &str,
        key: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MetricSample>> {
        let db = self.lock();
        let since = since.map(fmt_ts).unwrap_or_default();
        let mut stmt = db.prepare_cached(
            "SELECT key, value, ts FROM metrics
             WHERE task_name = ?1 AND key = ?2 AND ts >= ?3
             ORDER BY ts, id",
        )?;
        let rows = stmt
            .query_map(params![task_name, key, since], sample_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Distinct keys recorded for a task, sorted.
    pub fn keys(&self, task_name: &str) -> Result<Vec<String>> {
        let db = self.lock();
        let mut stmt = db.prepare_cached(
            "SELECT DISTINCT key FROM metrics WHERE task_name = ?1 ORDER BY key",
        )?;
        let keys = stmt
            .query_map([task_name], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    pub fn latest(&self, task_name: &str, key: &str) -> Result<Option<MetricSample>> {
        let db = self.lock();
        let sample = db
            .query_row(
                "SELECT key, value, ts FROM metrics
                 WHERE task_name = ?1 AND key = ?2
                 ORDER BY ts DESC, id DESC LIMIT 1",
                params![task_name, key],
                sample_from_row,
            )
            .optional()?;
        Ok(sample)
    }

    /// Delete samples older than `retention_days` (0 keeps everything).
    pub fn prune(&self, now: DateTime<Utc>, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = fmt_ts(now - Duration::days(i64::from(retention_days)));
        let db = self.lock();
        let n = db.execute("DELETE FROM metrics WHERE ts < ?1", [cutoff])?;
        if n > 0 {
            info!(removed = n, retention_days, "metrics pruned");
        }
        Ok(n)
    }

    /// Delete every sample, or only those of `task_name`.
    pub fn clear(&self, task_name: Option<&str>) -> Result<usize> {
        let db = self.lock();
        let n = match task_name {
            Some(task) => db.execute("DELETE FROM metrics WHERE task_name = ?1", [task])?,
            None => db.execute("DELETE FROM metrics", [])?,
        };
        info!(removed = n, task = task_name.unwrap_or("*"), "metrics cleared");
        Ok(n)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<MetricSample> {
    let raw: String = row.get(2)?;
    let ts = parse_ts(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, format!("bad timestamp {raw:?}").into())
    })?;
    Ok(MetricSample {
        key: row.get(0)?,
        value: row.get(1)?,
        ts,
    })
}
