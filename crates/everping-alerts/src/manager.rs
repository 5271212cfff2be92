use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use everping_core::{
    config::ThresholdRule,
    time::{fmt_ts, parse_ts},
    MetricSample, RunStatus, Severity,
};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::{
    db::init_db,
    error::Result,
    push::Notifier,
    types::{Alert, AlertEvent, Cleared, Condition, Decision},
};

const EVENT_COLUMNS: &str = "id, key, task_name, message, severity, at, suppressed";

const ALERT_COLUMNS: &str = "key, task_name, condition, message, severity, first_seen, last_seen, \
     suppressed_until, fire_count, occurrences";

/// De-duplicates alert conditions and hands the survivors to a [`Notifier`].
///
/// Each key (`{task}:{condition}`) pushes at most once per suppression
/// window. The window is fixed when the push happens: further hits inside it
/// update the stored state but never extend it.
pub struct AlertManager {
    db: Arc<Mutex<Connection>>,
    notifier: Arc<dyn Notifier>,
    suppress: Duration,
    thresholds: Vec<ThresholdRule>,
}

impl AlertManager {
    pub fn new(
        conn: Connection,
        notifier: Arc<dyn Notifier>,
        suppress_secs: u64,
        thresholds: Vec<ThresholdRule>,
    ) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            notifier,
            suppress: Duration::seconds(suppress_secs.min(u64::from(u32::MAX)) as i64),
            thresholds,
        })
    }

    /// Raise alerts for a finished run: `FAILED` and `TIMEOUT` only.
    pub async fn on_run_finished(
        &self,
        task_name: &str,
        status: RunStatus,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Decision>> {
        let (condition, verb) = match status {
            RunStatus::Failed => (Condition::Failed, "failed"),
            RunStatus::Timeout => (Condition::Timeout, "timed out"),
            _ => return Ok(None),
        };
        let message = match detail {
            Some(detail) => format!("task {task_name} {verb}: {detail}"),
            None => format!("task {task_name} {verb}"),
        };
        let severity = condition.default_severity();
        self.raise(task_name, condition, &message, severity, now)
            .await
            .map(Some)
    }

    /// Evaluate threshold rules against the samples of one run.
    ///
    /// Every matching sample counts; the second match for the same key in
    /// one run lands inside the window the first one opened.
    pub async fn on_metrics(
        &self,
        task_name: &str,
        samples: &[MetricSample],
        now: DateTime<Utc>,
    ) -> Result<Vec<Decision>> {
        let mut decisions = Vec::new();
        for sample in samples {
            for rule in &self.thresholds {
                if !rule.applies_to(task_name, &sample.key) || !rule.op.holds(sample.value, rule.value) {
                    continue;
                }
                let message = format!(
                    "task {task_name}: {} = {} {} {}",
                    sample.key,
                    sample.value,
                    rule.op.symbol(),
                    rule.value
                );
                let decision = self
                    .raise(
                        task_name,
                        Condition::Threshold(sample.key.clone()),
                        &message,
                        rule.severity,
                        now,
                    )
                    .await?;
                decisions.push(decision);
            }
        }
        Ok(decisions)
    }

    /// The task's job id is not in the registry.
    pub async fn on_job_missing(
        &self,
        task_name: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let message = format!("task {task_name} references unknown job '{job_id}'; task disabled");
        let condition = Condition::JobMissing;
        let severity = condition.default_severity();
        self.raise(task_name, condition, &message, severity, now).await
    }

    /// Record a positive evaluation and push it unless suppressed.
    ///
    /// State is committed before the push, and a failed push does not roll it
    /// back: the window applies either way.
    pub async fn raise(
        &self,
        task_name: &str,
        condition: Condition,
        message: &str,
        severity: Severity,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let key = condition.key_for(task_name);
        let alert = {
            let db = self.lock();
            let tx = db.unchecked_transaction()?;
            let existing = get_alert(&tx, &key)?;
            let open = existing.as_ref().is_some_and(|a| now < a.suppressed_until);
            record_event(&tx, &key, task_name, message, severity, now, open)?;

            if open {
                tx.execute(
                    "UPDATE alerts SET message = ?1, severity = ?2, last_seen = ?3,
                            occurrences = occurrences + 1
                     WHERE key = ?4",
                    params![message, severity.as_str(), fmt_ts(now), key],
                )?;
                tx.commit()?;
                debug!(%key, "alert suppressed");
                return Ok(Decision::Suppressed);
            }

            let until = now + self.suppress;
            tx.execute(
                "INSERT INTO alerts
                 (key, task_name, condition, message, severity, first_seen, last_seen,
                  suppressed_until, fire_count, occurrences)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, 1, 1)
                 ON CONFLICT(key) DO UPDATE SET
                    message = excluded.message,
                    severity = excluded.severity,
                    first_seen = excluded.first_seen,
                    last_seen = excluded.last_seen,
                    suppressed_until = excluded.suppressed_until,
                    fire_count = alerts.fire_count + 1,
                    occurrences = alerts.occurrences + 1",
                params![
                    key,
                    task_name,
                    condition.to_string(),
                    message,
                    severity.as_str(),
                    fmt_ts(now),
                    fmt_ts(until),
                ],
            )?;
            let alert = get_alert(&tx, &key)?
                .ok_or_else(|| crate::AlertError::Corrupt(format!("alert {key} vanished")))?;
            tx.commit()?;
            alert
        };

        match self.notifier.push(&alert).await {
            Ok(()) => Ok(Decision::Pushed),
            Err(e) => {
                warn!(key = %alert.key, notifier = self.notifier.name(), "alert push failed: {e}");
                Ok(Decision::PushFailed(e.to_string()))
            }
        }
    }

    /// All alerts, most recently seen first.
    pub fn list_alerts(&self) -> Result<Vec<Alert>> {
        let db = self.lock();
        let mut stmt = db.prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts ORDER BY last_seen DESC, key"
        ))?;
        let alerts = stmt
            .query_map([], alert_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(alerts)
    }

    pub fn get_alert(&self, key: &str) -> Result<Option<Alert>> {
        let db = self.lock();
        get_alert(&db, key)
    }

    /// Alert events, newest first, optionally for one key.
    pub fn history(&self, key: Option<&str>, limit: usize) -> Result<Vec<AlertEvent>> {
        let db = self.lock();
        let limit = limit as i64;
        let events = match key {
            Some(key) => {
                let mut stmt = db.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM alert_events WHERE key = ?1 ORDER BY id DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![key, limit], event_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = db.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM alert_events ORDER BY id DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map([limit], event_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(events)
    }

    /// Drop the event history and every alert whose window has closed.
    ///
    /// Alerts still inside their suppression window are kept, so clearing
    /// never lets a flapping condition push again early.
    pub fn clear(&self, now: DateTime<Utc>) -> Result<Cleared> {
        let db = self.lock();
        let tx = db.unchecked_transaction()?;
        let events = tx.execute("DELETE FROM alert_events", [])?;
        let alerts = tx.execute("DELETE FROM alerts WHERE suppressed_until <= ?1", [fmt_ts(now)])?;
        tx.commit()?;
        debug!(events, alerts, "alert history cleared");
        Ok(Cleared { events, alerts })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn get_alert(db: &Connection, key: &str) -> Result<Option<Alert>> {
    let alert = db
        .query_row(
            &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE key = ?1"),
            [key],
            alert_from_row,
        )
        .optional()?;
    Ok(alert)
}

fn record_event(
    db: &Connection,
    key: &str,
    task_name: &str,
    message: &str,
    severity: Severity,
    at: DateTime<Utc>,
    suppressed: bool,
) -> Result<()> {
    db.execute(
        "INSERT INTO alert_events (key, task_name, message, severity, at, suppressed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![key, task_name, message, severity.as_str(), fmt_ts(at), suppressed],
    )?;
    Ok(())
}

fn text<T>(idx: usize, raw: &str, parsed: Option<T>) -> rusqlite::Result<T> {
    parsed.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("unexpected value {raw:?}").into())
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<AlertEvent> {
    let severity: String = row.get(4)?;
    let at: String = row.get(5)?;
    Ok(AlertEvent {
        id: row.get(0)?,
        key: row.get(1)?,
        task_name: row.get(2)?,
        message: row.get(3)?,
        severity: text(4, &severity, severity.parse().ok())?,
        at: text(5, &at, parse_ts(&at))?,
        suppressed: row.get(6)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let condition: String = row.get(2)?;
    let severity: String = row.get(4)?;
    let first_seen: String = row.get(5)?;
    let last_seen: String = row.get(6)?;
    let suppressed_until: String = row.get(7)?;
    Ok(Alert {
        key: row.get(0)?,
        task_name: row.get(1)?,
        condition: text(2, &condition, condition.parse().ok())?,
        message: row.get(3)?,
        severity: text(4, &severity, severity.parse().ok())?,
        first_seen: text(5, &first_seen, parse_ts(&first_seen))?,
        last_seen: text(6, &last_seen, parse_ts(&last_seen))?,
        suppressed_until: text(7, &suppressed_until, parse_ts(&suppressed_until))?,
        fire_count: row.get(8)?,
        occurrences: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AlertError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use everping_core::config::ThresholdOp;

    /// Remembers every pushed key; optionally fails after recording.
    #[derive(Default)]
    struct RecordingNotifier {
        pushed: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingNotifier {
        fn pushed(&self) -> Vec<String> {
            self.pushed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &str {
            "recording"
        }

        async fn push(&self, alert: &Alert) -> crate::error::Result<()> {
            self.pushed.lock().unwrap().push(alert.key.clone());
            if self.fail {
                return Err(AlertError::Push("unreachable".into()));
            }
            Ok(())
        }
    }

    fn manager(notifier: Arc<RecordingNotifier>, suppress_secs: u64) -> AlertManager {
        let rules = vec![ThresholdRule {
            task: "*".into(),
            key: "cpu".into(),
            op: ThresholdOp::Gt,
            value: 90.0,
            severity: Severity::Critical,
        }];
        AlertManager::new(
            Connection::open_in_memory().unwrap(),
            notifier,
            suppress_secs,
            rules,
        )
        .unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn suppression_window_is_fixed() {
        let rec = Arc::new(RecordingNotifier::default());
        let m = manager(rec.clone(), 60);
        let at = |s: i64| t0() + Duration::seconds(s);

        let d = m.on_run_finished("backup", RunStatus::Failed, Some("exit 1"), at(0)).await.unwrap();
        assert_eq!(d, Some(Decision::Pushed));
        let d = m.on_run_finished("backup", RunStatus::Failed, None, at(10)).await.unwrap();
        assert_eq!(d, Some(Decision::Suppressed));
        // Hit at t+59 must not push the window out past t+60.
        let d = m.on_run_finished("backup", RunStatus::Failed, None, at(59)).await.unwrap();
        assert_eq!(d, Some(Decision::Suppressed));
        let d = m.on_run_finished("backup", RunStatus::Failed, None, at(61)).await.unwrap();
        assert_eq!(d, Some(Decision::Pushed));

        assert_eq!(rec.pushed(), vec!["backup:failed", "backup:failed"]);
        let alert = m.get_alert("backup:failed").unwrap().unwrap();
        assert_eq!(alert.fire_count, 2);
        assert_eq!(alert.occurrences, 4);
        assert_eq!(alert.first_seen, at(61));
        assert_eq!(alert.suppressed_until, at(121));
        assert_eq!(alert.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let rec = Arc::new(RecordingNotifier::default());
        let m = manager(rec.clone(), 900);
        m.on_run_finished("a", RunStatus::Failed, None, t0()).await.unwrap();
        m.on_run_finished("a", RunStatus::Timeout, None, t0()).await.unwrap();
        m.on_run_finished("b", RunStatus::Failed, None, t0()).await.unwrap();
        assert_eq!(rec.pushed(), vec!["a:failed", "a:timeout", "b:failed"]);
    }

    #[tokio::test]
    async fn success_raises_nothing() {
        let rec = Arc::new(RecordingNotifier::default());
        let m = manager(rec.clone(), 900);
        for status in [RunStatus::Success, RunStatus::Skipped] {
            assert_eq!(m.on_run_finished("a", status, None, t0()).await.unwrap(), None);
        }
        assert!(rec.pushed().is_empty());
        assert!(m.list_alerts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_failure_keeps_window() {
        let rec = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let m = manager(rec.clone(), 60);
        let d = m.on_run_finished("a", RunStatus::Failed, None, t0()).await.unwrap();
        assert!(matches!(d, Some(Decision::PushFailed(_))));
        let d = m
            .on_run_finished("a", RunStatus::Failed, None, t0() + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(d, Some(Decision::Suppressed));
        assert_eq!(rec.pushed().len(), 1);
    }

    #[tokio::test]
    async fn thresholds_match_rules() {
        let rec = Arc::new(RecordingNotifier::default());
        let m = manager(rec.clone(), 900);
        let sample = |key: &str, value: f64| MetricSample {
            key: key.into(),
            value,
            ts: t0(),
        };
        let decisions = m
            .on_metrics(
                "web",
                &[sample("cpu", 50.0), sample("cpu", 95.0), sample("mem", 99.0), sample("cpu", 97.0)],
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(decisions, vec![Decision::Pushed, Decision::Suppressed]);
        assert_eq!(rec.pushed(), vec!["web:threshold:cpu"]);
        let alert = m.get_alert("web:threshold:cpu").unwrap().unwrap();
        assert_eq!(alert.condition, Condition::Threshold("cpu".into()));
        assert_eq!(alert.severity, Severity::Critical);
        assert!(alert.message.contains("97"));
    }

    #[tokio::test]
    async fn every_evaluation_is_in_the_history() {
        let rec = Arc::new(RecordingNotifier::default());
        let m = manager(rec.clone(), 60);
        let at = |s: i64| t0() + Duration::seconds(s);
        for s in [0, 10, 61] {
            m.on_run_finished("backup", RunStatus::Failed, Some("exit 1"), at(s)).await.unwrap();
        }
        m.on_run_finished("other", RunStatus::Timeout, None, at(5)).await.unwrap();

        let events = m.history(Some("backup:failed"), 10).unwrap();
        let seen: Vec<_> = events.iter().map(|e| (e.at, e.suppressed)).collect();
        assert_eq!(seen, vec![(at(61), false), (at(10), true), (at(0), false)]);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(m.history(None, 10).unwrap().len(), 4);
        assert_eq!(m.history(None, 2).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn clear_keeps_open_windows() {
        let rec = Arc::new(RecordingNotifier::default());
        let m = manager(rec.clone(), 60);
        m.on_run_finished("old", RunStatus::Failed, None, t0()).await.unwrap();
        let now = t0() + Duration::seconds(100);
        m.on_run_finished("fresh", RunStatus::Failed, None, now).await.unwrap();

        let cleared = m.clear(now).unwrap();
        assert_eq!(cleared, Cleared { events: 2, alerts: 1 });
        assert!(m.history(None, 10).unwrap().is_empty());
        assert!(m.get_alert("old:failed").unwrap().is_none());

        // The surviving window still suppresses.
        let d = m.on_run_finished("fresh", RunStatus::Failed, None, now).await.unwrap();
        assert_eq!(d, Some(Decision::Suppressed));
        assert_eq!(rec.pushed(), vec!["old:failed", "fresh:failed"]);
    }

    #[tokio::test]
    async fn job_missing_is_a_warning() {
        let rec = Arc::new(RecordingNotifier::default());
        let m = manager(rec.clone(), 900);
        m.on_job_missing("nightly", "gone", t0()).await.unwrap();
        let alert = m.get_alert("nightly:job_missing").unwrap().unwrap();
        assert_eq!(alert.severity, Severity::Warning);
        assert!(alert.message.contains("gone"));
    }
}
