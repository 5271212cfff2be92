//! Evaluating triggers: when does a task fire next.
//!
//! Interval triggers are plain UTC arithmetic. Cron and deadline triggers are
//! evaluated in the task's IANA timezone, so `0 9 * * *` in `Asia/Shanghai`
//! means 09:00 Shanghai wall-clock time across DST changes.

use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use everping_core::Trigger;

use crate::error::{Result, SchedulerError};

const DEADLINE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

pub fn parse_timezone(name: &str) -> Result<Tz> {
    Tz::from_str(name).map_err(|_| SchedulerError::InvalidTrigger(format!("unknown timezone '{name}'")))
}

/// Check that `trigger` can be evaluated in `timezone` without computing
/// anything time-dependent.
pub fn validate(trigger: &Trigger, timezone: &str) -> Result<()> {
    let tz = parse_timezone(timezone)?;
    match trigger {
        Trigger::Interval { every_secs } => interval_duration(*every_secs).map(|_| ()),
        Trigger::Cron { expression } => cron_schedule(expression).map(|_| ()),
        Trigger::Deadline { at } => deadline_instant(at, &tz).map(|_| ()),
    }
}

/// The first fire time of a task that has none yet.
///
/// Interval: one period from `now`. Cron: the next occurrence strictly after
/// `now`. Deadline: the deadline itself, even if it already passed, so a
/// deadline missed while the daemon was down still fires once.
pub fn first_fire(trigger: &Trigger, timezone: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let tz = parse_timezone(timezone)?;
    match trigger {
        Trigger::Interval { every_secs } => Ok(now + interval_duration(*every_secs)?),
        Trigger::Cron { expression } => next_cron(expression, &tz, now),
        Trigger::Deadline { at } => deadline_instant(at, &tz),
    }
}

/// The fire time following a fire at `now`; `None` once a deadline has fired.
///
/// Computed from `now`, not from the missed slot, so a late tick never
/// produces a burst of catch-up fires.
pub fn next_after(
    trigger: &Trigger,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match trigger {
        Trigger::Interval { every_secs } => Ok(Some(now + interval_duration(*every_secs)?)),
        Trigger::Cron { expression } => {
            let tz = parse_timezone(timezone)?;
            next_cron(expression, &tz, now).map(Some)
        }
        Trigger::Deadline { .. } => Ok(None),
    }
}

fn interval_duration(every_secs: u64) -> Result<Duration> {
    if every_secs == 0 {
        return Err(SchedulerError::InvalidTrigger(
            "interval must be at least 1 second".into(),
        ));
    }
    i64::try_from(every_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| SchedulerError::InvalidTrigger(format!("interval {every_secs}s is too large")))
}

fn next_cron(expression: &str, tz: &Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = cron_schedule(expression)?;
    schedule
        .after(&now.with_timezone(tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            SchedulerError::InvalidTrigger(format!("cron '{expression}' has no future occurrence"))
        })
}

/// Parse a classic five-field expression (`min hour dom mon dow`).
pub fn cron_schedule(expression: &str) -> Result<cron::Schedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(SchedulerError::InvalidTrigger(format!(
            "cron '{expression}' must have 5 fields, found {}",
            fields.len()
        )));
    }
    let dow = normalize_dow(fields[4])
        .map_err(|e| SchedulerError::InvalidTrigger(format!("cron '{expression}': {e}")))?;
    let full = format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], dow
    );
    cron::Schedule::from_str(&full)
        .map_err(|e| SchedulerError::InvalidTrigger(format!("cron '{expression}': {e}")))
}

/// Classic cron numbers weekdays 0-6 from Sunday (7 is Sunday too); the
/// `cron` crate numbers them 1-7 from Sunday. Names pass through unchanged.
fn normalize_dow(field: &str) -> std::result::Result<String, String> {
    let mut parts = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((b, s)) => (b, Some(s)),
            None => (item, None),
        };
        let mapped = match base.split_once('-') {
            Some((lo, hi)) => match (lo.parse::<u8>(), hi.parse::<u8>()) {
                (Ok(lo), Ok(hi)) => {
                    if lo > 7 || hi > 7 || lo > hi {
                        return Err(format!("bad day-of-week range '{base}'"));
                    }
                    if hi == 7 && lo > 0 {
                        if step.is_some() {
                            return Err(format!("day-of-week range '{base}' with a step is not supported"));
                        }
                        // Saturday wraps to Sunday.
                        format!("{}-7,1", lo + 1)
                    } else if hi == 7 {
                        "1-7".to_string()
                    } else {
                        format!("{}-{}", lo + 1, hi + 1)
                    }
                }
                _ => base.to_string(),
            },
            None => match base.parse::<u8>() {
                Ok(n) if n <= 7 => ((n % 7) + 1).to_string(),
                Ok(n) => return Err(format!("day-of-week {n} out of range")),
                Err(_) => base.to_string(),
            },
        };
        match step {
            Some(s) => parts.push(format!("{mapped}/{s}")),
            None => parts.push(mapped),
        }
    }
    Ok(parts.join(","))
}

/// Resolve a deadline to a UTC instant.
///
/// Local forms are wall-clock time in `tz`. A time inside a DST gap does not
/// exist and is rejected; a time repeated by a DST fold takes the earlier
/// instant. Full RFC 3339 strings with an offset are accepted as-is.
pub fn deadline_instant(at: &str, tz: &Tz) -> Result<DateTime<Utc>> {
    let at = at.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(at) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = DEADLINE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(at, fmt).ok())
        .ok_or_else(|| {
            SchedulerError::InvalidTrigger(format!(
                "deadline '{at}' is not YYYY-MM-DDTHH:MM[:SS]"
            ))
        })?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            SchedulerError::InvalidTrigger(format!(
                "deadline '{at}' does not exist in {tz} (DST gap)"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike, Weekday};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn interval_adds_period() {
        let now = utc(2026, 3, 1, 9, 0, 0);
        let t = Trigger::Interval { every_secs: 90 };
        assert_eq!(first_fire(&t, "UTC", now).unwrap(), now + Duration::seconds(90));
        assert_eq!(
            next_after(&t, "UTC", now).unwrap(),
            Some(now + Duration::seconds(90))
        );
    }

    #[test]
    fn zero_interval_is_rejected() {
        let t = Trigger::Interval { every_secs: 0 };
        assert!(matches!(
            validate(&t, "UTC"),
            Err(SchedulerError::InvalidTrigger(_))
        ));
    }

    #[test]
    fn cron_next_is_strictly_after_now() {
        let t = Trigger::Cron {
            expression: "*/15 * * * *".into(),
        };
        let now = utc(2026, 3, 1, 9, 15, 0);
        assert_eq!(first_fire(&t, "UTC", now).unwrap(), utc(2026, 3, 1, 9, 30, 0));
    }

    #[test]
    fn cron_uses_task_timezone() {
        let t = Trigger::Cron {
            expression: "0 9 * * *".into(),
        };
        // 00:30 UTC is 08:30 in Shanghai; next 09:00 local is 01:00 UTC.
        let now = utc(2026, 3, 1, 0, 30, 0);
        assert_eq!(
            first_fire(&t, "Asia/Shanghai", now).unwrap(),
            utc(2026, 3, 1, 1, 0, 0)
        );
    }

    #[test]
    fn cron_sunday_accepts_zero_and_seven() {
        // 2026-03-02 is a Monday.
        let now = utc(2026, 3, 2, 12, 0, 0);
        for expr in ["0 8 * * 0", "0 8 * * 7"] {
            let t = Trigger::Cron {
                expression: expr.into(),
            };
            let next = first_fire(&t, "UTC", now).unwrap();
            assert_eq!(next.weekday(), Weekday::Sun, "{expr}");
            assert_eq!(next.hour(), 8);
        }
    }

    #[test]
    fn cron_weekday_range() {
        // Saturday noon; mon-fri range must land on Monday.
        let now = utc(2026, 3, 7, 12, 0, 0);
        let t = Trigger::Cron {
            expression: "30 6 * * 1-5".into(),
        };
        let next = first_fire(&t, "UTC", now).unwrap();
        assert_eq!(next, utc(2026, 3, 9, 6, 30, 0));
    }

    #[test]
    fn dow_normalization() {
        assert_eq!(normalize_dow("*").unwrap(), "*");
        assert_eq!(normalize_dow("0").unwrap(), "1");
        assert_eq!(normalize_dow("1-5").unwrap(), "2-6");
        assert_eq!(normalize_dow("5-7").unwrap(), "6-7,1");
        assert_eq!(normalize_dow("*/2").unwrap(), "*/2");
        assert_eq!(normalize_dow("MON,WED").unwrap(), "MON,WED");
        assert!(normalize_dow("8").is_err());
    }

    #[test]
    fn cron_needs_five_fields() {
        assert!(cron_schedule("* * * *").is_err());
        assert!(cron_schedule("0 * * * * *").is_err());
        assert!(cron_schedule("61 * * * *").is_err());
    }

    #[test]
    fn deadline_in_local_time() {
        let tz = parse_timezone("Asia/Shanghai").unwrap();
        assert_eq!(
            deadline_instant("2026-03-01T09:00", &tz).unwrap(),
            utc(2026, 3, 1, 1, 0, 0)
        );
        assert_eq!(
            deadline_instant("2026-03-01 09:00:30", &tz).unwrap(),
            utc(2026, 3, 1, 1, 0, 30)
        );
        assert!(deadline_instant("next tuesday", &tz).is_err());
    }

    #[test]
    fn deadline_dst_gap_and_fold() {
        let tz = parse_timezone("America/New_York").unwrap();
        // 2026-03-08 02:30 does not exist in New York.
        assert!(deadline_instant("2026-03-08T02:30", &tz).is_err());
        // 2026-11-01 01:30 happens twice; the EDT (earlier) one wins.
        assert_eq!(
            deadline_instant("2026-11-01T01:30", &tz).unwrap(),
            utc(2026, 11, 1, 5, 30, 0)
        );
    }

    #[test]
    fn deadline_has_no_follow_up() {
        let t = Trigger::Deadline {
            at: "2026-03-01T09:00".into(),
        };
        assert_eq!(next_after(&t, "UTC", utc(2026, 3, 1, 9, 0, 0)).unwrap(), None);
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let t = Trigger::Interval { every_secs: 5 };
        assert!(validate(&t, "Mars/Olympus").is_err());
    }
}
